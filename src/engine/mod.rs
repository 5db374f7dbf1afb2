//! Supervisor engine
//!
//! Owns every registry (states, services, processes, service types, data
//! types, hooks) and drives services through their states. The engine is
//! single-threaded and synchronous: the daemon loop feeds it signals, exits,
//! ready descriptors and expired alarms, and every call runs to completion.

pub mod active_db;
pub mod data;
pub mod hooks;
pub mod process;
pub mod service_type;
pub mod state;

pub use active_db::{ActiveDb, ActiveService, ServiceId};
pub use data::{DataEntry, DataError, DataKind, DataSet, DataType, Value};
pub use hooks::{kind, Event, EventKind, EventStatus, FdSet, HookId, HookResult, IoAction, IoWatch, DEFAULT_PRIORITY};
pub use process::{
    CommandLauncher, ExitStatus, Launcher, Pipe, PipeDirection, PipeSpec, Process, ProcessDb, ProcessId, ProcessSpec,
    ProcessType, ProcessTypeId, RecordingLauncher, SpawnError,
};
pub use service_type::{ServiceType, ServiceTypeId, ServiceTypeRegistry};
pub use state::{StateClass, StateDescriptor, StateId, StateRegistry};

use std::fmt::{self, Write as _};
use std::time::{Duration, Instant};

use crate::config::Config;
use hooks::{ErrorMessage, Hooks, NewActive, SystemChanged};
use process::ProcessTypeRegistry;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Service \"{0}\" already exists")]
    Duplicate(String),

    #[error("Service \"{0}\" has no state")]
    NoState(String),

    #[error("Can't {action} \"{service}\": {reason}")]
    InvalidTransition {
        service: String,
        action: &'static str,
        reason: String,
    },

    #[error("The system is going down")]
    SystemStopping,

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse state of the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemState {
    Null,
    Starting,
    Up,
    Stopping,
    Halt,
    Poweroff,
    Reboot,
    Exit,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Stopping => "stopping",
            Self::Halt => "halt",
            Self::Poweroff => "poweroff",
            Self::Reboot => "reboot",
            Self::Exit => "exit",
        }
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// The daemon should leave its loop
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Halt | Self::Poweroff | Self::Reboot | Self::Exit)
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens once every service is down after `stop_all`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhenOut {
    Poweroff,
    Reboot,
    Halt,
    /// Start the runlevel again
    Restart,
    #[default]
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Fail,
}

impl Severity {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

pub struct Engine {
    states: StateRegistry,
    services: ActiveDb,
    processes: ProcessDb,
    service_types: ServiceTypeRegistry,
    process_types: ProcessTypeRegistry,
    data_types: Vec<DataType>,
    hooks: Hooks,
    config: Config,
    launcher: Box<dyn Launcher>,
    system_state: SystemState,
    when_out: WhenOut,
    interrupt_pending: bool,
    runlevel: Option<String>,
    reporting: bool,
}

impl Engine {
    pub fn new(config: Config, launcher: Box<dyn Launcher>) -> Self {
        let runlevel = Some(config.runlevel.clone());
        let mut engine = Self {
            states: StateRegistry::new(),
            services: ActiveDb::new(),
            processes: ProcessDb::default(),
            service_types: ServiceTypeRegistry::new(),
            process_types: ProcessTypeRegistry::default(),
            data_types: Vec::new(),
            hooks: Hooks::default(),
            config,
            launcher,
            system_state: SystemState::Null,
            when_out: WhenOut::default(),
            interrupt_pending: false,
            runlevel,
            reporting: false,
        };
        engine.register_hook::<kind::IoWatcher, _>("process pipes", DEFAULT_PRIORITY, process::watch_pipes);
        engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn states(&self) -> &StateRegistry {
        &self.states
    }

    pub fn states_mut(&mut self) -> &mut StateRegistry {
        &mut self.states
    }

    pub fn services(&self) -> &ActiveDb {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ActiveDb {
        &mut self.services
    }

    pub fn processes(&self) -> &ProcessDb {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut ProcessDb {
        &mut self.processes
    }

    pub fn service_types(&self) -> &ServiceTypeRegistry {
        &self.service_types
    }

    pub fn service_types_mut(&mut self) -> &mut ServiceTypeRegistry {
        &mut self.service_types
    }

    // Data types

    pub fn register_data_type(&mut self, data_type: DataType) {
        log::debug!("Registering data type {}", data_type.name);
        self.data_types.push(data_type);
    }

    /// Most recent registration wins
    pub fn find_data_type(&self, name: &str) -> Option<DataType> {
        self.data_types.iter().rev().find(|t| t.name == name).copied()
    }

    // Service lookups

    pub fn find_service(&self, name: &str) -> Option<ServiceId> {
        self.services.find_by_exact_name(name)
    }

    pub fn service_name(&self, id: ServiceId) -> Option<&str> {
        self.services.get(id).map(|s| s.name.as_str())
    }

    pub fn state_of(&self, id: ServiceId) -> Option<&StateDescriptor> {
        let state = self.services.get(id)?.current_state?;
        self.states.get(state)
    }

    pub fn class_of(&self, id: ServiceId) -> Option<StateClass> {
        self.state_of(id).map(|s| s.class)
    }

    pub fn state_name(&self, id: ServiceId) -> Option<&str> {
        self.state_of(id).map(|s| s.name.as_str())
    }

    /// Look a state up by name, failing with `NotFound`
    pub fn state(&self, name: &str) -> Result<StateId, EngineError> {
        self.states
            .find(name)
            .ok_or_else(|| EngineError::NotFound(format!("State \"{}\"", name)))
    }

    fn describe(&self, id: ServiceId) -> String {
        self.service_name(id)
            .map_or_else(|| format!("{:?}", id), str::to_string)
    }

    // Registration

    /// Register a record built by a loader
    ///
    /// The record must carry a state. If a record with the same name exists
    /// in a transient state, it takes over the type and origin of `service`
    /// and its id is returned; any other existing record is a duplicate.
    pub fn register_service(&mut self, service: ActiveService) -> Result<ServiceId, EngineError> {
        if service.current_state.is_none() {
            return Err(EngineError::NoState(service.name));
        }

        if let Some(existing) = self.services.find_by_exact_name(&service.name) {
            let transient = self.state_of(existing).is_some_and(|s| s.transient);
            if !transient {
                return Err(EngineError::Duplicate(service.name));
            }

            log::debug!("Reusing {} which is still being parsed", service.name);
            if let Some(record) = self.services.get_mut(existing) {
                if service.service_type.is_some() {
                    record.service_type = service.service_type;
                }
                if service.origin.is_some() {
                    record.origin = service.origin;
                }
            }
            return Ok(existing);
        }

        let id = self.services.register(service)?;
        log::debug!("Registered service {}", self.describe(id));
        Ok(id)
    }

    /// Find-or-create in one step: a new record in `state` with `service_type`
    pub fn create_service(
        &mut self,
        name: &str,
        state: StateId,
        service_type: Option<ServiceTypeId>,
        origin: Option<&str>,
    ) -> Result<ServiceId, EngineError> {
        let mut record = ActiveService::new(name).with_state(state);
        record.service_type = service_type;
        record.origin = origin.map(str::to_string);
        self.register_service(record)
    }

    /// Release a settled service and everything bound to it
    pub fn free_service(&mut self, id: ServiceId) -> Result<(), EngineError> {
        let record = self
            .services
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("service {:?}", id)))?;

        if let Some(class) = self.class_of(id) {
            if !class.is_settled() {
                return Err(EngineError::InvalidTransition {
                    service: record.name.clone(),
                    action: "free",
                    reason: format!("it is {}", class.as_str()),
                });
            }
        }

        for process in record.processes.clone() {
            self.free_process(process);
        }
        if let Some(record) = self.services.remove(id) {
            log::debug!("Freed service {}", record.name);
        }
        Ok(())
    }

    // State transitions

    /// Move `id` into `state`
    ///
    /// Order: the old state's interrupt (when one is pending), the record
    /// update, the new state's init, then STATE_CHANGE and a system state
    /// check. If init already moved the service on, the nested transition has
    /// notified subscribers and this one does not.
    pub fn mark_service(&mut self, id: ServiceId, state: StateId) -> Result<(), EngineError> {
        let old = self
            .services
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("service {:?}", id)))?
            .current_state;
        if old == Some(state) {
            return Ok(());
        }
        let Some(descriptor) = self.states.get(state) else {
            return Err(EngineError::NotFound(format!("state {:?}", state)));
        };
        let init = descriptor.init.clone();
        let new_name = descriptor.name.clone();

        if self.interrupt_pending {
            let interrupt = old
                .and_then(|s| self.states.get(s))
                .and_then(|s| s.interrupt.clone());
            if let Some(interrupt) = interrupt {
                interrupt(self, id);
            }
        }

        let Some(record) = self.services.get_mut(id) else {
            return Ok(());
        };
        record.last_state = record.current_state;
        record.current_state = Some(state);
        record.state_entered = Instant::now();
        record.alarm = None;
        log::debug!("{} is now {}", record.name, new_name);

        if let Some(init) = init {
            init(self, id);
        }

        self.interrupt_pending = true;

        let still_here = self
            .services
            .get(id)
            .is_some_and(|s| s.current_state == Some(state));
        if still_here {
            self.dispatch::<kind::StateChange>(hooks::StateChanged { service: id });
        }

        self.check_system_state();
        Ok(())
    }

    /// `mark_service` by state name
    pub fn mark_service_named(&mut self, id: ServiceId, state: &str) -> Result<(), EngineError> {
        let state = self.state(state)?;
        self.mark_service(id, state)
    }

    pub fn set_alarm(&mut self, id: ServiceId, after: Duration) {
        if let Some(record) = self.services.get_mut(id) {
            record.alarm = Some(Instant::now() + after);
        }
    }

    pub fn clear_alarm(&mut self, id: ServiceId) {
        if let Some(record) = self.services.get_mut(id) {
            record.alarm = None;
        }
    }

    /// Earliest pending alarm
    pub fn next_alarm(&self) -> Option<Instant> {
        self.services.iter().filter_map(|(_, s)| s.alarm).min()
    }

    /// Fire the state alarm of every service whose deadline passed
    pub fn run_alarms(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        for id in self.services.ids() {
            let due = self
                .services
                .get(id)
                .and_then(|s| s.alarm)
                .is_some_and(|deadline| deadline <= now);
            if !due {
                continue;
            }
            self.clear_alarm(id);

            let alarm = self.state_of(id).and_then(|s| s.alarm.clone());
            if let Some(alarm) = alarm {
                log::debug!("Alarm for {}", self.describe(id));
                alarm(self, id);
                fired += 1;
            }
        }
        fired
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt_pending
    }

    /// Give every service's current state a chance to act on the changes
    /// since the last round
    pub fn run_interrupts(&mut self) {
        if !self.interrupt_pending {
            return;
        }
        self.interrupt_pending = false;

        for id in self.services.ids() {
            let interrupt = self.state_of(id).and_then(|s| s.interrupt.clone());
            if let Some(interrupt) = interrupt {
                interrupt(self, id);
            }
        }
    }

    // Starting and stopping

    pub fn start_service(&mut self, id: ServiceId) -> Result<(), EngineError> {
        if self.system_state == SystemState::Stopping {
            return Err(EngineError::SystemStopping);
        }
        let class = self
            .class_of(id)
            .ok_or_else(|| EngineError::NoState(self.describe(id)))?;

        match class {
            StateClass::Starting | StateClass::Up => Ok(()),
            StateClass::Failed | StateClass::Stopping => Err(EngineError::InvalidTransition {
                service: self.describe(id),
                action: "start",
                reason: format!("it is {}", class.as_str()),
            }),
            StateClass::Down => {
                let start = self
                    .service_type_of(id)
                    .and_then(|t| t.start.clone())
                    .ok_or_else(|| EngineError::InvalidTransition {
                        service: self.describe(id),
                        action: "start",
                        reason: "its type has no start method".to_string(),
                    })?;
                log::info!("Starting {}", self.describe(id));
                start(self, id)
            }
        }
    }

    pub fn stop_service(&mut self, id: ServiceId) -> Result<(), EngineError> {
        let class = self
            .class_of(id)
            .ok_or_else(|| EngineError::NoState(self.describe(id)))?;

        match class {
            StateClass::Down | StateClass::Failed | StateClass::Stopping => Ok(()),
            StateClass::Starting | StateClass::Up => {
                log::info!("Stopping {}", self.describe(id));
                match self.service_type_of(id).and_then(|t| t.stop.clone()) {
                    Some(stop) => stop(self, id),
                    None => {
                        self.kill_service_processes(id, nix::sys::signal::Signal::SIGTERM);
                        Ok(())
                    }
                }
            }
        }
    }

    fn service_type_of(&self, id: ServiceId) -> Option<&ServiceType> {
        let ty = self.services.get(id)?.service_type?;
        self.service_types.get(ty)
    }

    /// Start `name`, asking loaders to create it first if needed
    pub fn start_new_service_named(&mut self, name: &str) -> Result<ServiceId, EngineError> {
        if let Some(id) = self.services.find_by_exact_name(name) {
            self.start_service(id)?;
            return Ok(id);
        }
        if self.system_state == SystemState::Stopping {
            return Err(EngineError::SystemStopping);
        }

        let event = self.dispatch::<kind::NewActive>(NewActive {
            name: name.to_string(),
            service: None,
        });
        event
            .payload
            .service
            .or_else(|| self.services.find_by_exact_name(name))
            .ok_or_else(|| EngineError::NotFound(format!("Service \"{}\"", name)))
    }

    /// Take the system down, then do `when_out`
    pub fn stop_all(&mut self) {
        self.set_system_state(SystemState::Stopping);
        for id in self.services.ids() {
            // An earlier stop may have freed it
            if !self.services.contains(id) {
                continue;
            }
            if let Err(e) = self.stop_service(id) {
                let msg = format!("Could not stop {}: {}", self.describe(id), e);
                self.report(Severity::Warn, &msg);
            }
        }
        self.check_system_state();
    }

    pub fn when_out(&self) -> WhenOut {
        self.when_out
    }

    pub fn set_when_out(&mut self, when_out: WhenOut) {
        self.when_out = when_out;
    }

    pub fn runlevel(&self) -> Option<&str> {
        self.runlevel.as_deref()
    }

    pub fn set_runlevel(&mut self, name: &str) {
        self.runlevel = Some(name.to_string());
    }

    /// Stop everything and come back up in runlevel `name`
    pub fn change_runlevel(&mut self, name: &str) {
        log::info!("Changing runlevel to {}", name);
        self.set_runlevel(name);
        self.when_out = WhenOut::Restart;
        self.stop_all();
    }

    // System state

    pub fn system_state(&self) -> SystemState {
        self.system_state
    }

    pub fn set_system_state(&mut self, state: SystemState) {
        if self.system_state == state {
            return;
        }
        log::info!("System state {} -> {}", self.system_state, state);
        self.system_state = state;
        self.dispatch::<kind::SystemChange>(SystemChanged { state });
    }

    /// Start the runlevel and the extra services
    pub fn boot(&mut self) {
        self.set_system_state(SystemState::Starting);

        let mut names: Vec<String> = self.runlevel.iter().cloned().collect();
        names.extend(self.config.extra_services.iter().cloned());
        for name in names {
            if let Err(e) = self.start_new_service_named(&name) {
                self.report(
                    Severity::Fail,
                    &format!("Requested service \"{}\" could not be started: {}", name, e),
                );
            }
        }
        self.check_system_state();
    }

    fn count_class(&self, class: StateClass) -> usize {
        self.services
            .ids()
            .into_iter()
            .filter(|id| self.class_of(*id) == Some(class))
            .count()
    }

    /// Move the system state along once services settle
    pub fn check_system_state(&mut self) {
        match self.system_state {
            SystemState::Starting if self.count_class(StateClass::Starting) == 0 => {
                self.set_system_state(SystemState::Up);
            }
            SystemState::Up if self.count_class(StateClass::Starting) > 0 => {
                self.set_system_state(SystemState::Starting);
            }
            SystemState::Stopping => {
                let busy = self
                    .services
                    .ids()
                    .into_iter()
                    .any(|id| self.class_of(id).is_some_and(|c| !c.is_settled()));
                if busy {
                    return;
                }

                match self.when_out {
                    WhenOut::Restart => self.restart(),
                    WhenOut::Halt => self.set_system_state(SystemState::Halt),
                    WhenOut::Poweroff => self.set_system_state(SystemState::Poweroff),
                    WhenOut::Reboot => self.set_system_state(SystemState::Reboot),
                    WhenOut::Exit => self.set_system_state(SystemState::Exit),
                }
            }
            _ => {}
        }
    }

    fn restart(&mut self) {
        self.when_out = WhenOut::default();
        for id in self.services.ids() {
            if let Err(e) = self.free_service(id) {
                log::warn!("{}", e);
            }
        }
        self.boot();
    }

    // Reporting

    /// Log `message` and hand it to ERROR_MESSAGE subscribers
    pub fn report(&mut self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => log::debug!("{}", message),
            Severity::Info => log::info!("{}", message),
            Severity::Warn => log::warn!("{}", message),
            Severity::Fail => log::error!("{}", message),
        }

        // A subscriber reporting from inside its own dispatch
        if self.reporting {
            return;
        }
        self.reporting = true;
        self.dispatch::<kind::Error>(ErrorMessage {
            severity,
            message: message.to_string(),
        });
        self.reporting = false;
    }

    /// Human readable dump of services and watched descriptors
    pub fn dump(&mut self) -> String {
        let mut out = format!("System: {}\n", self.system_state);
        for (id, service) in self.services.iter() {
            let state = self.state_name(id).unwrap_or("<none>");
            let _ = writeln!(out, "  {:<30} {}", service.name, state);
            for process in &service.processes {
                if let Some(p) = self.processes.get(*process) {
                    let _ = writeln!(out, "    pid {} {:?}", p.pid, p.exit);
                }
            }
        }
        out.push_str("Watched descriptors:\n");
        out.push_str(&self.io_debug(None));
        out
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn setup() -> (Engine, StateId, StateId) {
        let mut engine = test_support::engine();
        let down = engine
            .states_mut()
            .register(StateDescriptor::new("STOPPED", "", StateClass::Down));
        let up = engine
            .states_mut()
            .register(StateDescriptor::new("RUNNING", "", StateClass::Up));
        (engine, down, up)
    }

    #[test]
    fn test_register_requires_state() {
        let (mut engine, _, _) = setup();
        let err = engine.register_service(ActiveService::new("x")).unwrap_err();
        assert!(matches!(err, EngineError::NoState(_)));
    }

    #[test]
    fn test_transient_reuse() {
        let (mut engine, down, _) = setup();
        let parsing = engine
            .states_mut()
            .register(StateDescriptor::new("PARSING", "", StateClass::Starting).transient());

        let first = engine.create_service("a", parsing, None, Some("/etc/a")).unwrap();
        let again = engine.create_service("a", down, None, Some("/etc/b")).unwrap();
        assert_eq!(first, again);
        assert_eq!(engine.services().len(), 1);
        assert_eq!(engine.services().get(first).unwrap().origin.as_deref(), Some("/etc/b"));
        // The state is not taken over
        assert_eq!(engine.state_name(first), Some("PARSING"));
    }

    #[test]
    fn test_init_sees_new_state_before_hooks() {
        let (mut engine, down, _) = setup();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let starting = {
            let seen = Rc::clone(&seen);
            engine.states_mut().register(
                StateDescriptor::new("START_RUNNING", "", StateClass::Starting).on_init(move |engine, id| {
                    seen.borrow_mut()
                        .push(format!("init:{}", engine.state_name(id).unwrap_or("")));
                }),
            )
        };
        {
            let seen = Rc::clone(&seen);
            engine.register_hook::<kind::StateChange, _>("test", DEFAULT_PRIORITY, move |engine, event| {
                let name = engine.state_name(event.payload.service).unwrap_or("");
                seen.borrow_mut().push(format!("hook:{}", name));
                Ok(())
            });
        }

        let id = engine.create_service("svc", down, None, None).unwrap();
        engine.mark_service(id, starting).unwrap();
        assert_eq!(*seen.borrow(), vec!["init:START_RUNNING", "hook:START_RUNNING"]);

        let record = engine.services().get(id).unwrap();
        assert_eq!(record.last_state, Some(down));
    }

    #[test]
    fn test_same_state_is_noop() {
        let (mut engine, down, _) = setup();
        let count = Rc::new(RefCell::new(0));
        {
            let count = Rc::clone(&count);
            engine.register_hook::<kind::StateChange, _>("test", DEFAULT_PRIORITY, move |_, _| {
                *count.borrow_mut() += 1;
                Ok(())
            });
        }
        let id = engine.create_service("svc", down, None, None).unwrap();
        engine.mark_service(id, down).unwrap();
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn test_interrupt_of_old_state() {
        let (mut engine, down, up) = setup();
        let hits = Rc::new(RefCell::new(0));
        let waiting = {
            let hits = Rc::clone(&hits);
            engine.states_mut().register(
                StateDescriptor::new("WAITING", "", StateClass::Starting).on_interrupt(move |_, _| {
                    *hits.borrow_mut() += 1;
                }),
            )
        };

        let id = engine.create_service("svc", down, None, None).unwrap();
        engine.mark_service(id, waiting).unwrap();
        assert!(engine.interrupt_pending());

        engine.run_interrupts();
        assert_eq!(*hits.borrow(), 1);
        assert!(!engine.interrupt_pending());

        // Nothing pending: leaving WAITING does not interrupt
        engine.mark_service(id, up).unwrap();
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_alarms() {
        let (mut engine, down, _) = setup();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let slow = {
            let fired = Rc::clone(&fired);
            engine.states_mut().register(
                StateDescriptor::new("SLOW", "", StateClass::Starting).on_alarm(move |engine, id| {
                    fired.borrow_mut().push(engine.describe(id));
                }),
            )
        };

        let id = engine.create_service("svc", down, None, None).unwrap();
        engine.mark_service(id, slow).unwrap();
        assert!(engine.next_alarm().is_none());

        engine.set_alarm(id, Duration::from_secs(5));
        let deadline = engine.next_alarm().unwrap();
        assert_eq!(engine.run_alarms(deadline - Duration::from_secs(1)), 0);
        assert_eq!(engine.run_alarms(deadline), 1);
        assert_eq!(*fired.borrow(), vec!["svc"]);
        assert!(engine.next_alarm().is_none());

        // A state change drops the alarm
        engine.set_alarm(id, Duration::from_secs(5));
        engine.mark_service(id, down).unwrap();
        assert!(engine.next_alarm().is_none());
    }

    #[test]
    fn test_system_state_flow() {
        let (mut engine, down, up) = setup();
        let changes = Rc::new(RefCell::new(Vec::new()));
        {
            let changes = Rc::clone(&changes);
            engine.register_hook::<kind::SystemChange, _>("test", DEFAULT_PRIORITY, move |_, event| {
                changes.borrow_mut().push(event.payload.state);
                Ok(())
            });
        }
        engine.set_runlevel("nothing");
        let id = engine.create_service("svc", up, None, None).unwrap();

        // No loader knows "nothing"
        engine.boot();
        assert_eq!(engine.system_state(), SystemState::Up);

        engine.set_when_out(WhenOut::Halt);
        engine.stop_all();
        // No type and no processes: stays up until someone marks it
        assert_eq!(engine.system_state(), SystemState::Stopping);
        engine.mark_service(id, down).unwrap();
        assert_eq!(engine.system_state(), SystemState::Halt);

        assert_eq!(
            *changes.borrow(),
            vec![SystemState::Starting, SystemState::Up, SystemState::Stopping, SystemState::Halt]
        );
    }

    #[test]
    fn test_report_no_recursion() {
        let mut engine = test_support::engine();
        let count = Rc::new(RefCell::new(0));
        {
            let count = Rc::clone(&count);
            engine.register_hook::<kind::Error, _>("test", DEFAULT_PRIORITY, move |engine, event| {
                *count.borrow_mut() += 1;
                assert_eq!(event.payload.severity, Severity::Warn);
                engine.report(Severity::Fail, "while reporting");
                Ok(())
            });
        }
        engine.report(Severity::Warn, "something odd");
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_free_service_requires_settled() {
        let (mut engine, down, up) = setup();
        let id = engine.create_service("svc", up, None, None).unwrap();
        assert!(engine.free_service(id).is_err());
        engine.mark_service(id, down).unwrap();
        engine.free_service(id).unwrap();
        assert!(engine.find_service("svc").is_none());
    }

    #[test]
    fn test_stop_all_skips_services_freed_on_the_way() {
        let (mut engine, down, up) = setup();
        let group = engine.service_types_mut().register(
            ServiceType::new("group", "").on_stop(move |engine, id| {
                engine.mark_service(id, down)?;
                match engine.find_service("member") {
                    Some(member) => engine.free_service(member),
                    None => Ok(()),
                }
            }),
        );
        let stubborn = engine.service_types_mut().register(ServiceType::new("stubborn", "").on_stop(|_, id| {
            Err(EngineError::InvalidTransition {
                service: format!("{:?}", id),
                action: "stop",
                reason: "it refuses".to_string(),
            })
        }));
        engine.create_service("leader", up, Some(group), None).unwrap();
        engine.create_service("member", down, None, None).unwrap();
        engine.create_service("mule", up, Some(stubborn), None).unwrap();

        let reports = Rc::new(RefCell::new(Vec::new()));
        {
            let reports = Rc::clone(&reports);
            engine.register_hook::<kind::Error, _>("test", DEFAULT_PRIORITY, move |_, event| {
                reports.borrow_mut().push(event.payload.message.clone());
                Ok(())
            });
        }

        engine.stop_all();
        assert!(engine.find_service("member").is_none());
        let reports = reports.borrow();
        assert_eq!(reports.len(), 1, "{:?}", reports);
        assert!(reports[0].starts_with("Could not stop mule"));
    }

    #[test]
    fn test_start_refused_while_stopping() {
        let (mut engine, down, _) = setup();
        let id = engine.create_service("svc", down, None, None).unwrap();
        engine.set_system_state(SystemState::Stopping);
        assert!(matches!(engine.start_service(id), Err(EngineError::SystemStopping)));
    }
}
