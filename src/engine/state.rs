//! Active-state registry
//!
//! A state is a named lifecycle stage contributed by whoever needs it (service
//! types, the service-file loader, ...). Each carries a coarse class that the
//! rest of the system uses for policy, plus optional callbacks:
//!
//! ```text
//!            mark_service(svc, NEW)
//!                    │
//!   OLD.interrupt ◄──┤ (only when an interrupt is pending)
//!                    │
//!   current = NEW ◄──┤
//!                    │
//!     NEW.init   ◄───┤
//!                    │
//!   STATE_CHANGE ◄───┘ hooks see current == NEW
//!
//!   NEW.alarm ◄── deadline set with Engine::set_alarm expires
//! ```

use std::fmt;
use std::rc::Rc;

use crate::list::{Handle, List};

use super::{Engine, ServiceId};

/// Callback invoked with the engine and the affected service
pub type ServiceCallback = Rc<dyn Fn(&mut Engine, ServiceId)>;

/// What a state roughly means, regardless of who registered it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateClass {
    Starting,
    Up,
    Stopping,
    Down,
    Failed,
}

impl StateClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Stopping => "stopping",
            Self::Down => "down",
            Self::Failed => "failed",
        }
    }

    /// Numeric code used on external buses
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Up => 1,
            Self::Down => 2,
            Self::Failed => 3,
            Self::Starting => 4,
            Self::Stopping => 5,
        }
    }

    /// Terminal classes: nothing is running and nothing will happen on its own
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Down | Self::Failed)
    }
}

/// Registry handle of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(Handle);

/// Named lifecycle stage
pub struct StateDescriptor {
    pub name: String,
    pub description: String,
    pub class: StateClass,
    /// A service in this state may be re-created over (see `Engine::register_service`)
    pub transient: bool,
    pub interrupt: Option<ServiceCallback>,
    pub init: Option<ServiceCallback>,
    pub alarm: Option<ServiceCallback>,
}

impl StateDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, class: StateClass) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            class,
            transient: false,
            interrupt: None,
            init: None,
            alarm: None,
        }
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn on_interrupt(mut self, f: impl Fn(&mut Engine, ServiceId) + 'static) -> Self {
        self.interrupt = Some(Rc::new(f));
        self
    }

    pub fn on_init(mut self, f: impl Fn(&mut Engine, ServiceId) + 'static) -> Self {
        self.init = Some(Rc::new(f));
        self
    }

    pub fn on_alarm(mut self, f: impl Fn(&mut Engine, ServiceId) + 'static) -> Self {
        self.alarm = Some(Rc::new(f));
        self
    }
}

impl fmt::Debug for StateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDescriptor")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("transient", &self.transient)
            .field("interrupt", &self.interrupt.is_some())
            .field("init", &self.init.is_some())
            .field("alarm", &self.alarm.is_some())
            .finish()
    }
}

/// Registered states
///
/// Names are not deduplicated: a later registration shadows an earlier one
/// with the same name during [`StateRegistry::find`], and both stay iterable.
#[derive(Default)]
pub struct StateRegistry {
    states: List<StateDescriptor>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, state: StateDescriptor) -> StateId {
        log::debug!("Registering state {} ({})", state.name, state.class.as_str());
        StateId(self.states.push_back(state))
    }

    pub fn unregister(&mut self, id: StateId) -> Option<StateDescriptor> {
        self.states.remove(id.0)
    }

    /// Exact-name lookup, most recent registration first
    pub fn find(&self, name: &str) -> Option<StateId> {
        self.states
            .iter_rev()
            .find(|(_, s)| s.name == name)
            .map(|(h, _)| StateId(h))
    }

    pub fn get(&self, id: StateId) -> Option<&StateDescriptor> {
        self.states.get(id.0)
    }

    pub fn contains(&self, id: StateId) -> bool {
        self.states.contains(id.0)
    }

    /// All states, most recent registration first
    pub fn iter(&self) -> impl Iterator<Item = (StateId, &StateDescriptor)> {
        self.states.iter_rev().map(|(h, s)| (StateId(h), s))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
