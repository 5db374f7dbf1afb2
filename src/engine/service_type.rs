//! Service types
//!
//! A type decides how a service is started and stopped. The engine only
//! calls the callbacks; what they spawn or mark is up to the type.

use std::fmt;
use std::rc::Rc;

use crate::list::{Handle, List};

use super::{Engine, EngineError, ServiceId};

pub type TypeCallback = Rc<dyn Fn(&mut Engine, ServiceId) -> Result<(), EngineError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceTypeId(Handle);

pub struct ServiceType {
    pub name: String,
    pub description: String,
    /// Not offered to users, e.g. the placeholder used while parsing
    pub hidden: bool,
    pub start: Option<TypeCallback>,
    pub stop: Option<TypeCallback>,
}

impl ServiceType {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            hidden: false,
            start: None,
            stop: None,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn on_start(mut self, f: impl Fn(&mut Engine, ServiceId) -> Result<(), EngineError> + 'static) -> Self {
        self.start = Some(Rc::new(f));
        self
    }

    pub fn on_stop(mut self, f: impl Fn(&mut Engine, ServiceId) -> Result<(), EngineError> + 'static) -> Self {
        self.stop = Some(Rc::new(f));
        self
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceType")
            .field("name", &self.name)
            .field("hidden", &self.hidden)
            .field("start", &self.start.is_some())
            .field("stop", &self.stop.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct ServiceTypeRegistry {
    types: List<ServiceType>,
}

impl ServiceTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service_type: ServiceType) -> ServiceTypeId {
        log::debug!("Registering service type {}", service_type.name);
        ServiceTypeId(self.types.push_back(service_type))
    }

    pub fn unregister(&mut self, id: ServiceTypeId) -> Option<ServiceType> {
        self.types.remove(id.0)
    }

    /// Most recent registration wins
    pub fn find(&self, name: &str) -> Option<ServiceTypeId> {
        self.types
            .iter_rev()
            .find(|(_, t)| t.name == name)
            .map(|(h, _)| ServiceTypeId(h))
    }

    pub fn get(&self, id: ServiceTypeId) -> Option<&ServiceType> {
        self.types.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServiceTypeId, &ServiceType)> {
        self.types.iter().map(|(h, t)| (ServiceTypeId(h), t))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
