//! Event hooks
//!
//! Every event kind owns an ordered table of subscribers. A dispatch walks a
//! snapshot of that table: lower priority values run first, and among equal
//! priorities the most recently registered hook runs first, so a late-loaded
//! module sees an event before the general ones loaded earlier.
//!
//! Hooks may register or unregister hooks (including themselves) while a
//! dispatch is running. A hook removed mid-walk is skipped if it has not run
//! yet; a hook added mid-walk waits for the next dispatch.
//!
//! The `handled` status is advisory. The engine never stops a walk because of
//! it; kinds such as pipe output rely on subscribers checking it before
//! claiming the event.

use std::collections::BTreeSet;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::list::{Handle, List};

use super::{Engine, EngineError, ProcessId, ServiceId, Severity, SystemState};

/// Priority used when a caller has no ordering requirement
pub const DEFAULT_PRIORITY: i32 = 50;

pub type HookResult = Result<(), EngineError>;

type HookFn<P> = Rc<dyn Fn(&mut Engine, &mut Event<P>) -> HookResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Unhandled,
    Handled,
}

/// One dispatch of one kind
#[derive(Debug)]
pub struct Event<P> {
    pub payload: P,
    pub status: EventStatus,
}

impl<P> Event<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            status: EventStatus::Unhandled,
        }
    }

    pub fn is_handled(&self) -> bool {
        self.status == EventStatus::Handled
    }

    pub fn mark_handled(&mut self) {
        self.status = EventStatus::Handled;
    }
}

// Payloads

/// A service entered a new state; read its record for the details
#[derive(Debug, Clone, Copy)]
pub struct StateChanged {
    pub service: ServiceId,
}

#[derive(Debug, Clone, Copy)]
pub struct SystemChanged {
    pub state: SystemState,
}

/// A bound process was reaped; its exit status is on the process record
#[derive(Debug, Clone, Copy)]
pub struct ProcessExited {
    pub service: ServiceId,
    pub process: ProcessId,
}

/// Data arrived on a pipe; it sits in that pipe's input buffer
#[derive(Debug, Clone, Copy)]
pub struct PipeOutput {
    pub service: ServiceId,
    pub process: ProcessId,
    /// Index into the process' pipes
    pub pipe: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SignalReceived {
    pub signal: i32,
}

#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub severity: Severity,
    pub message: String,
}

/// A loader is asked to create the record for `name`
#[derive(Debug, Clone)]
pub struct NewActive {
    pub name: String,
    /// Set by the subscriber that created (or found) the record
    pub service: Option<ServiceId>,
}

pub type FdSet = BTreeSet<RawFd>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAction {
    /// Add the descriptors you want watched to `fds`
    Check,
    /// `fds` holds the ready descriptors; handle and remove yours
    Call,
    /// Close your descriptors, we are going down
    Close,
    /// Describe your descriptors in `debug`
    Debug,
}

#[derive(Debug, Clone)]
pub struct IoWatch {
    pub action: IoAction,
    pub fds: FdSet,
    /// For `Debug`: only describe watchers whose source contains this text
    pub filter: Option<String>,
    pub debug: String,
}

impl IoWatch {
    pub fn new(action: IoAction) -> Self {
        Self {
            action,
            fds: FdSet::new(),
            filter: None,
            debug: String::new(),
        }
    }

    /// Whether a debug request wants output from `source`
    pub fn wants_debug(&self, source: &str) -> bool {
        self.filter.as_deref().map_or(true, |f| source.contains(f))
    }
}

/// Subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId {
    kind: &'static str,
    handle: Handle,
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.handle)
    }
}

struct Registration<P> {
    source: String,
    priority: i32,
    hook: HookFn<P>,
}

/// Ordered subscribers of one kind
pub struct HookTable<P> {
    hooks: List<Registration<P>>,
}

impl<P> Default for HookTable<P> {
    fn default() -> Self {
        Self { hooks: List::new() }
    }
}

impl<P> HookTable<P> {
    fn insert(&mut self, source: &str, priority: i32, hook: HookFn<P>) -> Handle {
        let reg = Registration {
            source: source.to_string(),
            priority,
            hook,
        };

        let anchor = self
            .hooks
            .iter()
            .find(|(_, r)| r.priority >= priority)
            .map(|(h, _)| h);

        match anchor {
            Some(h) => self.hooks.insert_before(h, reg),
            None => self.hooks.push_back(reg),
        }
    }

    fn snapshot(&self) -> Vec<(Handle, String, HookFn<P>)> {
        self.hooks
            .iter()
            .map(|(h, r)| (h, r.source.clone(), Rc::clone(&r.hook)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Sources in dispatch order
    pub fn sources(&self) -> Vec<&str> {
        self.hooks.iter().map(|(_, r)| r.source.as_str()).collect()
    }
}

/// All hook tables, one per kind
#[derive(Default)]
pub struct Hooks {
    state_change: HookTable<StateChanged>,
    system_change: HookTable<SystemChanged>,
    process_exit: HookTable<ProcessExited>,
    pipe_watcher: HookTable<PipeOutput>,
    signal: HookTable<SignalReceived>,
    error_message: HookTable<ErrorMessage>,
    io_watcher: HookTable<IoWatch>,
    new_active: HookTable<NewActive>,
}

/// A typed event kind and where its subscribers live
pub trait EventKind: 'static {
    type Payload;
    const NAME: &'static str;

    fn table(hooks: &Hooks) -> &HookTable<Self::Payload>;
    fn table_mut(hooks: &mut Hooks) -> &mut HookTable<Self::Payload>;
}

/// Event kind markers
pub mod kind {
    use super::*;

    pub struct StateChange;
    pub struct SystemChange;
    pub struct ProcessExit;
    pub struct PipeWatcher;
    pub struct Signal;
    pub struct Error;
    pub struct IoWatcher;
    pub struct NewActive;

    impl EventKind for StateChange {
        type Payload = StateChanged;
        const NAME: &'static str = "STATE_CHANGE";

        fn table(hooks: &Hooks) -> &HookTable<StateChanged> {
            &hooks.state_change
        }
        fn table_mut(hooks: &mut Hooks) -> &mut HookTable<StateChanged> {
            &mut hooks.state_change
        }
    }

    impl EventKind for SystemChange {
        type Payload = SystemChanged;
        const NAME: &'static str = "SYSTEM_CHANGE";

        fn table(hooks: &Hooks) -> &HookTable<SystemChanged> {
            &hooks.system_change
        }
        fn table_mut(hooks: &mut Hooks) -> &mut HookTable<SystemChanged> {
            &mut hooks.system_change
        }
    }

    impl EventKind for ProcessExit {
        type Payload = ProcessExited;
        const NAME: &'static str = "PROCESS_EXIT";

        fn table(hooks: &Hooks) -> &HookTable<ProcessExited> {
            &hooks.process_exit
        }
        fn table_mut(hooks: &mut Hooks) -> &mut HookTable<ProcessExited> {
            &mut hooks.process_exit
        }
    }

    impl EventKind for PipeWatcher {
        type Payload = PipeOutput;
        const NAME: &'static str = "PIPE_WATCHER";

        fn table(hooks: &Hooks) -> &HookTable<PipeOutput> {
            &hooks.pipe_watcher
        }
        fn table_mut(hooks: &mut Hooks) -> &mut HookTable<PipeOutput> {
            &mut hooks.pipe_watcher
        }
    }

    impl EventKind for Signal {
        type Payload = SignalReceived;
        const NAME: &'static str = "SIGNAL";

        fn table(hooks: &Hooks) -> &HookTable<SignalReceived> {
            &hooks.signal
        }
        fn table_mut(hooks: &mut Hooks) -> &mut HookTable<SignalReceived> {
            &mut hooks.signal
        }
    }

    impl EventKind for Error {
        type Payload = ErrorMessage;
        const NAME: &'static str = "ERROR_MESSAGE";

        fn table(hooks: &Hooks) -> &HookTable<ErrorMessage> {
            &hooks.error_message
        }
        fn table_mut(hooks: &mut Hooks) -> &mut HookTable<ErrorMessage> {
            &mut hooks.error_message
        }
    }

    impl EventKind for IoWatcher {
        type Payload = IoWatch;
        const NAME: &'static str = "IO_WATCHER";

        fn table(hooks: &Hooks) -> &HookTable<IoWatch> {
            &hooks.io_watcher
        }
        fn table_mut(hooks: &mut Hooks) -> &mut HookTable<IoWatch> {
            &mut hooks.io_watcher
        }
    }

    impl EventKind for NewActive {
        type Payload = super::NewActive;
        const NAME: &'static str = "NEW_ACTIVE";

        fn table(hooks: &Hooks) -> &HookTable<super::NewActive> {
            &hooks.new_active
        }
        fn table_mut(hooks: &mut Hooks) -> &mut HookTable<super::NewActive> {
            &mut hooks.new_active
        }
    }
}

impl Engine {
    /// Subscribe `hook` to events of kind `K`
    ///
    /// Duplicate registrations are not detected; each one runs.
    pub fn register_hook<K, F>(&mut self, source: &str, priority: i32, hook: F) -> HookId
    where
        K: EventKind,
        F: Fn(&mut Engine, &mut Event<K::Payload>) -> HookResult + 'static,
    {
        log::debug!("Adding {} hook from {} (priority {})", K::NAME, source, priority);
        let handle = K::table_mut(&mut self.hooks).insert(source, priority, Rc::new(hook));
        HookId {
            kind: K::NAME,
            handle,
        }
    }

    /// Remove a subscription, returns false if it was not registered
    pub fn unregister_hook<K: EventKind>(&mut self, id: HookId) -> bool {
        if id.kind != K::NAME {
            log::warn!("Hook {} is not a {} hook", id, K::NAME);
            return false;
        }
        let removed = K::table_mut(&mut self.hooks).hooks.remove(id.handle).is_some();
        if !removed {
            log::debug!("Could not find {} hook {} to delete", K::NAME, id);
        }
        removed
    }

    /// Subscribers of kind `K` in dispatch order
    pub fn hook_table<K: EventKind>(&self) -> &HookTable<K::Payload> {
        K::table(&self.hooks)
    }

    /// Run every subscriber of `K` with `payload` and return the final event
    pub fn dispatch<K: EventKind>(&mut self, payload: K::Payload) -> Event<K::Payload> {
        let snapshot = K::table(&self.hooks).snapshot();
        let mut event = Event::new(payload);

        for (handle, source, hook) in snapshot {
            if !K::table(&self.hooks).hooks.contains(handle) {
                continue;
            }
            if let Err(e) = hook(self, &mut event) {
                log::warn!("{} hook from {} failed: {}", K::NAME, source, e);
            }
        }

        event
    }

    /// Collect the descriptors subscribers want watched
    pub fn io_check(&mut self) -> FdSet {
        self.dispatch::<kind::IoWatcher>(IoWatch::new(IoAction::Check))
            .payload
            .fds
    }

    /// Hand ready descriptors to their owners, returns the unclaimed ones
    pub fn io_call(&mut self, ready: FdSet) -> FdSet {
        let mut watch = IoWatch::new(IoAction::Call);
        watch.fds = ready;
        let leftover = self.dispatch::<kind::IoWatcher>(watch).payload.fds;
        for fd in &leftover {
            log::debug!("Nobody claimed ready descriptor {}", fd);
        }
        leftover
    }

    pub fn io_close(&mut self) {
        self.dispatch::<kind::IoWatcher>(IoWatch::new(IoAction::Close));
    }

    /// Describe every watched descriptor
    pub fn io_debug(&mut self, filter: Option<&str>) -> String {
        let mut watch = IoWatch::new(IoAction::Debug);
        watch.filter = filter.map(str::to_string);
        self.dispatch::<kind::IoWatcher>(watch).payload.debug
    }
}
