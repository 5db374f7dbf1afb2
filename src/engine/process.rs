//! Process records, pipes and spawning
//!
//! A process is always bound to a service and tagged with a process type
//! ("parse-process", "daemon-process", ...). The type's exit callback is the
//! only place the exit status is interpreted; it must free the record.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::rc::Rc;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::Signal;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{pipe2, Pid};

use crate::list::{Handle, List};

use super::hooks::{kind, Event, HookResult, IoAction, IoWatch, PipeOutput, ProcessExited};
use super::{Engine, EngineError, ServiceId};

pub type ExitCallback = Rc<dyn Fn(&mut Engine, ServiceId, ProcessId)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessTypeId(Handle);

/// Role a process plays for its service
pub struct ProcessType {
    pub name: String,
    pub on_exit: Option<ExitCallback>,
}

impl ProcessType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_exit: None,
        }
    }

    pub fn on_exit(mut self, f: impl Fn(&mut Engine, ServiceId, ProcessId) + 'static) -> Self {
        self.on_exit = Some(Rc::new(f));
        self
    }
}

#[derive(Default)]
pub struct ProcessTypeRegistry {
    types: List<ProcessType>,
}

impl ProcessTypeRegistry {
    pub fn register(&mut self, process_type: ProcessType) -> ProcessTypeId {
        log::debug!("Registering process type {}", process_type.name);
        ProcessTypeId(self.types.push_back(process_type))
    }

    pub fn unregister(&mut self, id: ProcessTypeId) -> Option<ProcessType> {
        self.types.remove(id.0)
    }

    pub fn find(&self, name: &str) -> Option<ProcessTypeId> {
        self.types
            .iter_rev()
            .find(|(_, t)| t.name == name)
            .map(|(h, _)| ProcessTypeId(h))
    }

    pub fn get(&self, id: ProcessTypeId) -> Option<&ProcessType> {
        self.types.get(id.0)
    }
}

/// How a reaped child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// Child writes, we read
    Output,
    /// We write, child reads
    Input,
    /// Unix socket pair, both ways
    Both,
}

impl PipeDirection {
    fn readable(&self) -> bool {
        matches!(self, Self::Output | Self::Both)
    }
}

/// Requested pipe: direction and the descriptor numbers the child sees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeSpec {
    pub direction: PipeDirection,
    pub targets: Vec<RawFd>,
}

impl PipeSpec {
    pub fn new(direction: PipeDirection, targets: &[RawFd]) -> Self {
        Self {
            direction,
            targets: targets.to_vec(),
        }
    }
}

/// Our end of a pipe bound to a process
#[derive(Debug)]
pub struct Pipe {
    pub direction: PipeDirection,
    pub targets: Vec<RawFd>,
    /// `None` once the child closed its side
    file: Option<File>,
    /// Data read from the child that no subscriber consumed yet
    pub buffer: Vec<u8>,
}

impl Pipe {
    pub fn fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    pub fn targets_fd(&self, fd: RawFd) -> bool {
        self.targets.contains(&fd)
    }

    /// Send bytes to the child
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.write_all(bytes),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    fn close(&mut self) {
        self.file = None;
    }

    /// Read whatever is available; returns bytes read and whether the child hung up
    fn fill(&mut self) -> (usize, bool) {
        let Some(file) = self.file.as_mut() else {
            return (0, true);
        };

        let mut chunk = [0u8; 1024];
        let mut total = 0;
        loop {
            match file.read(&mut chunk) {
                Ok(0) => return (total, true),
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return (total, false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Read from pipe {} failed: {}", file.as_raw_fd(), e);
                    return (total, true);
                }
            }
        }
    }
}

/// Bookkeeping for one spawned child
#[derive(Debug)]
pub struct Process {
    pub process_type: ProcessTypeId,
    pub service: ServiceId,
    pub pid: Pid,
    /// Set once reaped
    pub exit: Option<ExitStatus>,
    pub pipes: Vec<Pipe>,
}

impl Process {
    pub fn pipe_to(&self, target: RawFd) -> Option<usize> {
        self.pipes.iter().position(|p| p.targets_fd(target))
    }
}

#[derive(Default)]
pub struct ProcessDb {
    processes: List<Process>,
}

impl ProcessDb {
    fn insert(&mut self, process: Process) -> ProcessId {
        ProcessId(self.processes.push_back(process))
    }

    fn remove(&mut self, id: ProcessId) -> Option<Process> {
        self.processes.remove(id.0)
    }

    pub fn get(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(id.0)
    }

    pub fn get_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(id.0)
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.processes.contains(id.0)
    }

    /// Live (not yet reaped) process with this pid
    pub fn find_by_pid(&self, pid: Pid) -> Option<ProcessId> {
        self.processes
            .iter()
            .find(|(_, p)| p.pid == pid && p.exit.is_none())
            .map(|(h, _)| ProcessId(h))
    }

    /// Process and pipe index owning our end `fd`
    pub fn find_by_fd(&self, fd: RawFd) -> Option<(ProcessId, usize)> {
        self.processes.iter().find_map(|(h, p)| {
            p.pipes
                .iter()
                .position(|pipe| pipe.fd() == Some(fd))
                .map(|i| (ProcessId(h), i))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcessId, &Process)> {
        self.processes.iter().map(|(h, p)| (ProcessId(h), p))
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

/// What to run for a service
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub pipes: Vec<PipeSpec>,
}

impl ProcessSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    /// Split a shell-style command line
    pub fn parse(cmdline: &str) -> Result<Self, SpawnError> {
        let (program, args) = parse_command(cmdline)?;
        let mut argv = vec![program];
        argv.extend(args);
        Ok(Self::new(argv))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn pipe(mut self, pipe: PipeSpec) -> Self {
        self.pipes.push(pipe);
        self
    }
}

/// Child side of a pipe, to be placed at `target` in the child
#[derive(Debug)]
pub struct ChildFd {
    pub fd: OwnedFd,
    pub target: RawFd,
}

/// Everything a launcher needs to start one child
#[derive(Debug)]
pub struct LaunchRequest {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub fds: Vec<ChildFd>,
}

/// Fork/exec mechanism
pub trait Launcher {
    fn launch(&mut self, request: LaunchRequest) -> Result<Pid, SpawnError>;
    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<(), SpawnError>;
}

/// Launches real children with `std::process::Command`
///
/// Children are not waited on here; the daemon reaps every pid on SIGCHLD.
#[derive(Debug, Default)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&mut self, request: LaunchRequest) -> Result<Pid, SpawnError> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| SpawnError::InvalidCommand(String::new()))?;

        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        cmd.env_clear();
        cmd.envs(request.env.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let wiring: Vec<(RawFd, RawFd)> = request
            .fds
            .iter()
            .map(|c| (c.fd.as_raw_fd(), c.target))
            .collect();

        // Runs after fork, before exec
        unsafe {
            cmd.pre_exec(move || {
                for &(src, target) in &wiring {
                    if src == target {
                        if libc::fcntl(src, libc::F_SETFD, 0) < 0 {
                            return Err(io::Error::last_os_error());
                        }
                    } else if libc::dup2(src, target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                // Already a session leader is the only failure
                let _ = libc::setsid();
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| SpawnError::Spawn(e.to_string()))?;
        let pid = Pid::from_raw(child.id() as i32);
        // Child ends are closed here when `request` drops
        drop(child);
        Ok(pid)
    }

    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<(), SpawnError> {
        nix::sys::signal::kill(pid, signal).map_err(|source| SpawnError::Kill {
            pid: pid.as_raw(),
            source,
        })
    }
}

/// A launched (pretend) child
#[derive(Debug)]
pub struct Launched {
    pub pid: Pid,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub fds: Vec<ChildFd>,
}

#[derive(Debug, Default)]
struct Recorded {
    launched: Vec<Launched>,
    killed: Vec<(Pid, Signal)>,
    next_pid: i32,
    fail_next: bool,
}

/// Launcher that records requests instead of forking
///
/// Used for dry runs and tests. Clones share the same record, so a copy kept
/// outside the engine can inspect what was launched and can hold the child
/// ends of pipes to play the child's part.
#[derive(Debug, Clone, Default)]
pub struct RecordingLauncher {
    inner: Rc<RefCell<Recorded>>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next launch fail
    pub fn fail_next(&self) {
        self.inner.borrow_mut().fail_next = true;
    }

    pub fn argvs(&self) -> Vec<Vec<String>> {
        self.inner.borrow().launched.iter().map(|l| l.argv.clone()).collect()
    }

    pub fn last_pid(&self) -> Option<Pid> {
        self.inner.borrow().launched.last().map(|l| l.pid)
    }

    pub fn env_of(&self, pid: Pid) -> Vec<(String, String)> {
        self.inner
            .borrow()
            .launched
            .iter()
            .find(|l| l.pid == pid)
            .map(|l| l.env.clone())
            .unwrap_or_default()
    }

    pub fn killed(&self) -> Vec<(Pid, Signal)> {
        self.inner.borrow().killed.clone()
    }

    /// Take the child end of the pipe `pid` sees at `target`
    pub fn take_child_fd(&self, pid: Pid, target: RawFd) -> Option<OwnedFd> {
        let mut inner = self.inner.borrow_mut();
        let launched = inner.launched.iter_mut().find(|l| l.pid == pid)?;
        let index = launched.fds.iter().position(|c| c.target == target)?;
        Some(launched.fds.remove(index).fd)
    }
}

impl Launcher for RecordingLauncher {
    fn launch(&mut self, request: LaunchRequest) -> Result<Pid, SpawnError> {
        let mut inner = self.inner.borrow_mut();
        if std::mem::take(&mut inner.fail_next) {
            return Err(SpawnError::Spawn("launch refused".into()));
        }

        inner.next_pid += 1;
        let pid = Pid::from_raw(1000 + inner.next_pid);
        log::info!("Would run {:?} as pid {}", request.argv, pid);
        inner.launched.push(Launched {
            pid,
            argv: request.argv,
            env: request.env,
            fds: request.fds,
        });
        Ok(pid)
    }

    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<(), SpawnError> {
        log::info!("Would send {} to {}", signal, pid);
        self.inner.borrow_mut().killed.push((pid, signal));
        Ok(())
    }
}

/// Parse a command line into program and arguments
fn parse_command(cmd: &str) -> Result<(String, Vec<String>), SpawnError> {
    let parts = shlex::split(cmd).ok_or_else(|| SpawnError::InvalidCommand(cmd.to_string()))?;

    let mut parts = parts.into_iter();
    let program = parts
        .next()
        .ok_or_else(|| SpawnError::InvalidCommand(cmd.to_string()))?;

    Ok((program, parts.collect()))
}

fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Create one pipe; returns our end and the child's end
fn open_pipe(direction: PipeDirection) -> Result<(File, OwnedFd), SpawnError> {
    let (first, second) = match direction {
        PipeDirection::Both => socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::SOCK_CLOEXEC),
        PipeDirection::Output | PipeDirection::Input => pipe2(OFlag::O_CLOEXEC),
    }
    .map_err(|e| SpawnError::Pipe(e.into()))?;

    // pipe2 gives (read, write)
    let (ours, theirs) = match direction {
        PipeDirection::Output | PipeDirection::Both => (first, second),
        PipeDirection::Input => (second, first),
    };

    set_nonblocking(&ours).map_err(|e| SpawnError::Pipe(e.into()))?;
    Ok((File::from(ours), theirs))
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Failed to signal process {pid}: {source}")]
    Kill {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },
}

impl Engine {
    pub fn register_process_type(&mut self, process_type: ProcessType) -> ProcessTypeId {
        self.process_types.register(process_type)
    }

    pub fn find_process_type(&self, name: &str) -> Option<ProcessTypeId> {
        self.process_types.find(name)
    }

    pub fn process_type_name(&self, id: ProcessId) -> Option<&str> {
        let process = self.processes.get(id)?;
        self.process_types
            .get(process.process_type)
            .map(|t| t.name.as_str())
    }

    /// Launch `spec` as a process of `process_type` bound to `service`
    ///
    /// The child environment holds SERVICE, NAME, SERVICE_FILE (when the
    /// service has an origin) and PATH, followed by `spec.env`.
    pub fn spawn_bound(
        &mut self,
        service: ServiceId,
        process_type: ProcessTypeId,
        spec: ProcessSpec,
    ) -> Result<ProcessId, EngineError> {
        let record = self
            .services
            .get(service)
            .ok_or_else(|| EngineError::NotFound(format!("service {:?}", service)))?;
        if self.process_types.get(process_type).is_none() {
            return Err(EngineError::NotFound(format!("process type {:?}", process_type)));
        }
        if spec.argv.is_empty() {
            return Err(SpawnError::InvalidCommand(String::new()).into());
        }

        let mut env = vec![
            ("SERVICE".to_string(), record.name.clone()),
            ("NAME".to_string(), record.short_name().to_string()),
        ];
        if let Some(origin) = &record.origin {
            env.push(("SERVICE_FILE".to_string(), origin.clone()));
        }
        env.push(("PATH".to_string(), self.config.path_env.clone()));
        env.extend(spec.env);

        let mut pipes = Vec::with_capacity(spec.pipes.len());
        let mut fds = Vec::new();
        for p in spec.pipes {
            let (ours, theirs) = open_pipe(p.direction)?;
            let mut targets = p.targets.iter();
            if let Some(&first) = targets.next() {
                for &extra in targets {
                    let dup = theirs.try_clone().map_err(SpawnError::Pipe)?;
                    fds.push(ChildFd { fd: dup, target: extra });
                }
                fds.push(ChildFd {
                    fd: theirs,
                    target: first,
                });
            }
            pipes.push(Pipe {
                direction: p.direction,
                targets: p.targets,
                file: Some(ours),
                buffer: Vec::new(),
            });
        }

        log::debug!("Launching {:?} for {}", spec.argv, record.name);
        let pid = self.launcher.launch(LaunchRequest {
            argv: spec.argv,
            env,
            fds,
        })?;

        let id = self.processes.insert(Process {
            process_type,
            service,
            pid,
            exit: None,
            pipes,
        });
        if let Some(record) = self.services.get_mut(service) {
            record.processes.push(id);
        }
        Ok(id)
    }

    /// Send `signal` to a live process
    pub fn kill_process(&mut self, id: ProcessId, signal: Signal) -> Result<(), EngineError> {
        let process = self
            .processes
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("process {:?}", id)))?;
        if process.exit.is_some() {
            return Ok(());
        }
        let pid = process.pid;
        self.launcher.kill(pid, signal)?;
        Ok(())
    }

    /// Signal every live process bound to `service`
    pub fn kill_service_processes(&mut self, service: ServiceId, signal: Signal) -> usize {
        let ids = self
            .services
            .get(service)
            .map(|s| s.processes.clone())
            .unwrap_or_default();

        let mut sent = 0;
        for id in ids {
            match self.kill_process(id, signal) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("{}", e),
            }
        }
        sent
    }

    /// Drop a process record and its pipes
    pub fn free_process(&mut self, id: ProcessId) {
        let Some(process) = self.processes.remove(id) else {
            return;
        };
        if let Some(service) = self.services.get_mut(process.service) {
            service.processes.retain(|p| *p != id);
        }
    }

    /// Feed a reaped child into the engine; returns false for unknown pids
    pub fn process_exited(&mut self, pid: Pid, status: ExitStatus) -> bool {
        let Some(id) = self.processes.find_by_pid(pid) else {
            log::debug!("Reaped unknown pid {} ({:?})", pid, status);
            return false;
        };

        let (service, process_type) = match self.processes.get_mut(id) {
            Some(p) => {
                p.exit = Some(status);
                (p.service, p.process_type)
            }
            None => return false,
        };

        // Whatever the child wrote last
        let pipe_count = self.processes.get(id).map_or(0, |p| p.pipes.len());
        for index in 0..pipe_count {
            self.service_pipe(id, index);
        }

        self.dispatch::<kind::ProcessExit>(ProcessExited { service, process: id });

        let (name, on_exit) = match self.process_types.get(process_type) {
            Some(t) => (t.name.clone(), t.on_exit.clone()),
            None => ("<unregistered>".to_string(), None),
        };
        log::debug!("Process {} ({}) exited: {:?}", pid, name, status);

        if let Some(on_exit) = on_exit {
            on_exit(self, service, id);
        }

        if self.processes.contains(id) {
            log::warn!("Exit handler of {} left process {} behind, freeing it", name, pid);
            self.free_process(id);
        }
        true
    }

    /// Read pending data from one pipe and let subscribers look at it
    pub(crate) fn service_pipe(&mut self, id: ProcessId, index: usize) {
        let Some(process) = self.processes.get_mut(id) else {
            return;
        };
        let service = process.service;
        let Some(pipe) = process.pipes.get_mut(index) else {
            return;
        };
        if !pipe.direction.readable() {
            return;
        }

        let (read, hung_up) = pipe.fill();
        if read > 0 {
            let event = self.dispatch::<kind::PipeWatcher>(PipeOutput {
                service,
                process: id,
                pipe: index,
            });
            if !event.is_handled() {
                self.log_unclaimed_output(id, index);
            }
        }

        if hung_up {
            if let Some(pipe) = self.processes.get_mut(id).and_then(|p| p.pipes.get_mut(index)) {
                pipe.close();
            }
        }
    }

    fn log_unclaimed_output(&mut self, id: ProcessId, index: usize) {
        let Some(process) = self.processes.get_mut(id) else {
            return;
        };
        let service = process.service;
        let Some(pipe) = process.pipes.get_mut(index) else {
            return;
        };
        if pipe.direction != PipeDirection::Output {
            return;
        }

        let output = std::mem::take(&mut pipe.buffer);
        let name = self
            .services
            .get(service)
            .map_or("?", |s| s.name.as_str());
        for line in String::from_utf8_lossy(&output).lines() {
            log::info!("{}: {}", name, line);
        }
    }
}

/// IO_WATCHER subscriber for every readable pipe of every process
pub(super) fn watch_pipes(engine: &mut Engine, event: &mut Event<IoWatch>) -> HookResult {
    match event.payload.action {
        IoAction::Check => {
            for (_, process) in engine.processes.iter() {
                for pipe in &process.pipes {
                    if pipe.direction.readable() {
                        if let Some(fd) = pipe.fd() {
                            event.payload.fds.insert(fd);
                        }
                    }
                }
            }
        }
        IoAction::Call => {
            let ready: Vec<RawFd> = event.payload.fds.iter().copied().collect();
            for fd in ready {
                if let Some((id, index)) = engine.processes.find_by_fd(fd) {
                    event.payload.fds.remove(&fd);
                    engine.service_pipe(id, index);
                }
            }
        }
        IoAction::Debug => {
            if !event.payload.wants_debug("process pipes") {
                return Ok(());
            }
            for (_, process) in engine.processes.iter() {
                let service = engine
                    .services
                    .get(process.service)
                    .map_or("?", |s| s.name.as_str());
                for pipe in &process.pipes {
                    if let Some(fd) = pipe.fd() {
                        let _ = writeln!(
                            event.payload.debug,
                            " {}: {:?} pipe of {} (pid {}) to {:?}",
                            fd, pipe.direction, service, process.pid, pipe.targets
                        );
                    }
                }
            }
        }
        IoAction::Close => {}
    }
    Ok(())
}
