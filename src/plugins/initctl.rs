//! sysvinit `/dev/initctl` compatibility
//!
//! `telinit` and friends write fixed-size `init_request` records into the
//! FIFO. Only runlevel changes are acted on.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::sys::stat::Mode;

use crate::engine::{kind, Engine, Event, HookResult, IoAction, IoWatch, Severity, WhenOut, DEFAULT_PRIORITY};

pub const INIT_MAGIC: i32 = 0x0309_1969;
pub const INIT_CMD_RUNLVL: i32 = 1;

/// `sizeof(struct init_request)`
pub const REQUEST_SIZE: usize = 384;

const SOURCE: &str = "initctl";

/// Header of a sysvinit `init_request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitRequest {
    pub magic: i32,
    pub cmd: i32,
    pub runlevel: i32,
    pub sleeptime: i32,
}

impl InitRequest {
    pub fn runlevel_change(level: char) -> Self {
        Self {
            magic: INIT_MAGIC,
            cmd: INIT_CMD_RUNLVL,
            runlevel: level as i32,
            sleeptime: 0,
        }
    }

    /// Decode one full record; `None` for short or foreign data
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != REQUEST_SIZE {
            return None;
        }
        let field = |i: usize| i32::from_ne_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]]);
        let request = Self {
            magic: field(0),
            cmd: field(1),
            runlevel: field(2),
            sleeptime: field(3),
        };
        (request.magic == INIT_MAGIC).then_some(request)
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        for (i, v) in [self.magic, self.cmd, self.runlevel, self.sleeptime].iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
        }
        buf
    }
}

/// What a runlevel request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Poweroff,
    Reboot,
    Single,
    Reload,
    Requeue,
    Start(String),
}

impl Command {
    pub fn from_runlevel(level: i32) -> Option<Self> {
        let c = u8::try_from(level).ok().map(char::from)?;
        Some(match c {
            '0' => Self::Poweroff,
            '6' => Self::Reboot,
            'S' | 's' => Self::Single,
            'U' | 'u' => Self::Reload,
            'Q' | 'q' => Self::Requeue,
            c => Self::Start(format!("runlevel{}", c)),
        })
    }
}

pub fn apply(engine: &mut Engine, command: Command) {
    match command {
        Command::Poweroff => {
            log::info!("initctl: powering off");
            engine.set_when_out(WhenOut::Poweroff);
            engine.stop_all();
        }
        Command::Reboot => {
            log::info!("initctl: rebooting");
            engine.set_when_out(WhenOut::Reboot);
            engine.stop_all();
        }
        Command::Single => {
            log::warn!("initctl: going single user");
            engine.change_runlevel("single");
        }
        Command::Reload => log::info!("initctl: reload requested"),
        Command::Requeue => log::debug!("initctl: Q request ignored"),
        Command::Start(name) => {
            if let Err(e) = engine.start_new_service_named(&name) {
                engine.report(Severity::Fail, &format!("Service \"{}\" could not be executed: {}", name, e));
            }
        }
    }
}

/// The FIFO and where it lives
pub struct Initctl {
    path: PathBuf,
    fifo: Option<File>,
}

impl Initctl {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fifo: None,
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fifo.as_ref().map(|f| f.as_raw_fd())
    }

    /// Create the FIFO if missing and (re)open it when it is not the one we
    /// hold
    pub fn open(&mut self) -> io::Result<()> {
        if !self.path.exists() {
            nix::unistd::mkfifo(&self.path, Mode::S_IRUSR | Mode::S_IWUSR)?;
        }

        if let Some(fifo) = &self.fifo {
            let same = match (fifo.metadata(), std::fs::metadata(&self.path)) {
                (Ok(held), Ok(on_disk)) => held.dev() == on_disk.dev() && held.ino() == on_disk.ino(),
                _ => false,
            };
            if same {
                return Ok(());
            }
            self.fifo = None;
        }

        let fifo = open_fifo(&self.path)?;
        log::debug!("Opened {} on fd {}", self.path.display(), fifo.as_raw_fd());
        self.fifo = Some(fifo);
        Ok(())
    }

    pub fn close(&mut self) {
        self.fifo = None;
    }

    /// Drain every complete request waiting in the FIFO
    fn read_requests(&mut self) -> Vec<InitRequest> {
        let mut requests = Vec::new();
        let Some(fifo) = self.fifo.as_mut() else {
            return requests;
        };

        let mut buf = [0u8; REQUEST_SIZE];
        loop {
            match fifo.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => match InitRequest::parse(&buf[..n]) {
                    Some(r) => requests.push(r),
                    None => log::warn!("Got bogus init request"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Error reading request: {}", e);
                    break;
                }
            }
        }
        requests
    }
}

fn open_fifo(path: &Path) -> io::Result<File> {
    // Read-write so the FIFO never reports EOF when the last writer leaves
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)?;

    if !file.metadata()?.file_type().is_fifo() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a fifo", path.display()),
        ));
    }
    Ok(file)
}

/// Open the FIFO and subscribe to I/O and SIGHUP
pub fn register(engine: &mut Engine) -> Rc<RefCell<Initctl>> {
    let initctl = Rc::new(RefCell::new(Initctl::new(&engine.config().initctl_path)));
    if let Err(e) = initctl.borrow_mut().open() {
        log::warn!("Failed to open {}: {}", engine.config().initctl_path.display(), e);
    }

    let io = Rc::clone(&initctl);
    engine.register_hook::<kind::IoWatcher, _>(SOURCE, DEFAULT_PRIORITY, move |engine, event| {
        watch(engine, event, &io)
    });

    let hup = Rc::clone(&initctl);
    engine.register_hook::<kind::Signal, _>(SOURCE, DEFAULT_PRIORITY, move |_, event| {
        if event.payload.signal == libc::SIGHUP {
            if let Err(e) = hup.borrow_mut().open() {
                log::warn!("Failed to reopen initctl: {}", e);
            }
        }
        Ok(())
    });

    initctl
}

fn watch(engine: &mut Engine, event: &mut Event<IoWatch>, initctl: &Rc<RefCell<Initctl>>) -> HookResult {
    let Some(fd) = initctl.borrow().fd() else {
        return Ok(());
    };

    match event.payload.action {
        IoAction::Check => {
            event.payload.fds.insert(fd);
        }
        IoAction::Call => {
            if !event.payload.fds.remove(&fd) {
                return Ok(());
            }
            let requests = initctl.borrow_mut().read_requests();
            for request in requests {
                if request.cmd != INIT_CMD_RUNLVL {
                    log::debug!("Got unimplemented init request {}", request.cmd);
                    continue;
                }
                match Command::from_runlevel(request.runlevel) {
                    Some(command) => apply(engine, command),
                    None => log::warn!("Got bogus runlevel {}", request.runlevel),
                }
            }
        }
        IoAction::Close => initctl.borrow_mut().close(),
        IoAction::Debug => {
            if event.payload.wants_debug(SOURCE) {
                let _ = writeln!(event.payload.debug, " {}: Used by {}", fd, SOURCE);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{hooks::NewActive, FdSet, RecordingLauncher, SystemState};
    use std::io::Write;

    fn fifo_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nginit-initctl-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("initctl")
    }

    fn engine(path: &Path) -> Engine {
        let config = Config {
            initctl_path: path.to_path_buf(),
            ..Config::default()
        };
        Engine::new(config, Box::new(RecordingLauncher::new()))
    }

    fn send(path: &Path, request: InitRequest) {
        let mut writer = OpenOptions::new().write(true).open(path).unwrap();
        writer.write_all(&request.to_bytes()).unwrap();
    }

    #[test]
    fn test_parse_request() {
        let req = InitRequest::runlevel_change('3');
        assert_eq!(InitRequest::parse(&req.to_bytes()), Some(req));
        assert_eq!(InitRequest::parse(&req.to_bytes()[..100]), None);

        let mut bogus = req.to_bytes();
        bogus[0] ^= 0xff;
        assert_eq!(InitRequest::parse(&bogus), None);
    }

    #[test]
    fn test_runlevel_commands() {
        assert_eq!(Command::from_runlevel('0' as i32), Some(Command::Poweroff));
        assert_eq!(Command::from_runlevel('6' as i32), Some(Command::Reboot));
        assert_eq!(Command::from_runlevel('s' as i32), Some(Command::Single));
        assert_eq!(Command::from_runlevel('q' as i32), Some(Command::Requeue));
        assert_eq!(Command::from_runlevel('U' as i32), Some(Command::Reload));
        assert_eq!(
            Command::from_runlevel('3' as i32),
            Some(Command::Start("runlevel3".into()))
        );
        assert_eq!(Command::from_runlevel(-1), None);
    }

    #[test]
    fn test_fifo_requests_reach_engine() {
        let path = fifo_path("start");
        let mut engine = engine(&path);
        let initctl = register(&mut engine);
        let fd = initctl.borrow().fd().unwrap();

        let asked = Rc::new(RefCell::new(Vec::new()));
        {
            let asked = Rc::clone(&asked);
            engine.register_hook::<kind::NewActive, _>("test", DEFAULT_PRIORITY, move |_, event: &mut Event<NewActive>| {
                asked.borrow_mut().push(event.payload.name.clone());
                Ok(())
            });
        }

        assert!(engine.io_check().contains(&fd));
        send(&path, InitRequest::runlevel_change('3'));
        let leftover = engine.io_call(FdSet::from([fd]));
        assert!(leftover.is_empty());
        assert_eq!(*asked.borrow(), vec!["runlevel3"]);

        send(&path, InitRequest::runlevel_change('0'));
        engine.io_call(FdSet::from([fd]));
        assert_eq!(engine.when_out(), WhenOut::Poweroff);
        // Nothing to stop, so the system goes straight through
        assert_eq!(engine.system_state(), SystemState::Poweroff);
    }

    #[test]
    fn test_close_and_reopen_on_hup() {
        let path = fifo_path("hup");
        let mut engine = engine(&path);
        let initctl = register(&mut engine);
        assert!(initctl.borrow().fd().is_some());

        engine.io_close();
        assert!(initctl.borrow().fd().is_none());
        assert!(engine.io_check().is_empty());

        engine.dispatch::<kind::Signal>(crate::engine::hooks::SignalReceived { signal: libc::SIGHUP });
        assert!(initctl.borrow().fd().is_some());
    }

    #[test]
    fn test_not_a_fifo() {
        let path = fifo_path("regular");
        std::fs::write(&path, b"").unwrap();
        let mut initctl = Initctl::new(&path);
        assert!(initctl.open().is_err());
        assert!(initctl.fd().is_none());
    }
}
