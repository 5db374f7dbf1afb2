//! Active-service database
//!
//! One record per supervised name. Lookups go through a bucket index keyed by
//! the name hash, then compare the full name.

use std::collections::HashMap;
use std::time::Instant;

use crate::hash::{hash_str, Hash};
use crate::list::{Handle, List};

use super::data::DataSet;
use super::process::ProcessId;
use super::service_type::ServiceTypeId;
use super::state::StateId;
use super::EngineError;

/// Database handle of a service record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(Handle);

/// One supervised unit
#[derive(Debug)]
pub struct ActiveService {
    pub name: String,
    /// Never `None` once registered
    pub current_state: Option<StateId>,
    pub last_state: Option<StateId>,
    /// When the service entered its current state
    pub state_entered: Instant,
    pub service_type: Option<ServiceTypeId>,
    /// Which file or source created this record
    pub origin: Option<String>,
    pub data: DataSet,
    pub processes: Vec<ProcessId>,
    /// Deadline for the current state's alarm callback
    pub alarm: Option<Instant>,
}

impl ActiveService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current_state: None,
            last_state: None,
            state_entered: Instant::now(),
            service_type: None,
            origin: None,
            data: DataSet::new(),
            processes: Vec::new(),
            alarm: None,
        }
    }

    pub fn with_state(mut self, state: StateId) -> Self {
        self.current_state = Some(state);
        self
    }

    /// Text after the last `/`, e.g. "tty1" for "getty/tty1"
    pub fn short_name(&self) -> &str {
        match self.name.rsplit_once('/') {
            Some((_, tail)) if !tail.is_empty() => tail,
            _ => &self.name,
        }
    }
}

/// Live service records
#[derive(Default)]
pub struct ActiveDb {
    services: List<ActiveService>,
    index: HashMap<Hash, Vec<ServiceId>>,
}

impl ActiveDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-sensitive exact match
    pub fn find_by_exact_name(&self, name: &str) -> Option<ServiceId> {
        self.index
            .get(&hash_str(name))?
            .iter()
            .copied()
            .find(|id| self.services.get(id.0).is_some_and(|s| s.name == name))
    }

    /// Insert a record; a record with the same name must not exist
    pub fn register(&mut self, service: ActiveService) -> Result<ServiceId, EngineError> {
        if self.find_by_exact_name(&service.name).is_some() {
            return Err(EngineError::Duplicate(service.name));
        }

        let bucket = hash_str(&service.name);
        let id = ServiceId(self.services.push_back(service));
        self.index.entry(bucket).or_default().push(id);
        Ok(id)
    }

    /// Drop a record from the registry and hand it back
    pub fn remove(&mut self, id: ServiceId) -> Option<ActiveService> {
        let service = self.services.remove(id.0)?;
        let bucket = hash_str(&service.name);
        if let Some(ids) = self.index.get_mut(&bucket) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                self.index.remove(&bucket);
            }
        }
        Some(service)
    }

    pub fn get(&self, id: ServiceId) -> Option<&ActiveService> {
        self.services.get(id.0)
    }

    pub fn get_mut(&mut self, id: ServiceId) -> Option<&mut ActiveService> {
        self.services.get_mut(id.0)
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        self.services.contains(id.0)
    }

    /// Registration order
    pub fn iter(&self) -> impl Iterator<Item = (ServiceId, &ActiveService)> {
        self.services.iter().map(|(h, s)| (ServiceId(h), s))
    }

    /// Snapshot of ids, safe to walk while the database changes
    pub fn ids(&self) -> Vec<ServiceId> {
        self.services.handles().into_iter().map(ServiceId).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
