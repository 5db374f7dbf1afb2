//! D-Bus event bridge
//!
//! Broadcasts engine events as signals on the system bus:
//! - `astatus_change(service, class, state)` on every service state change
//! - `system_state_change(state)` when the system state moves
//! - `system_output(service, process_type, output)` for service output
//! - `print_error(severity, message)` for reported failures
//!
//! Engine hooks run synchronously and only queue a [`BusSignal`]. The
//! [`run`] task owns the bus connection and emits whatever is queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use zbus::{connection::Builder, interface, object_server::SignalEmitter, Connection};

use crate::engine::{kind, Engine, HookResult, PipeDirection, DEFAULT_PRIORITY};

pub const BUS_NAME: &str = "org.initng.signal.source";
pub const OBJECT_PATH: &str = "/org/initng/signal";

const SOURCE: &str = "dbus";
const MAX_ATTEMPTS: u32 = 30;

/// One signal waiting to go out on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusSignal {
    StatusChange {
        service: String,
        class: i32,
        state: String,
    },
    SystemStateChange(i32),
    SystemOutput {
        service: String,
        process_type: String,
        output: String,
    },
    PrintError {
        severity: i32,
        message: String,
    },
    /// Drop the connection and connect again
    Reconnect,
}

/// The object served at [`OBJECT_PATH`]; it only carries signals
pub struct SignalSource;

#[interface(name = "org.initng.signals")]
impl SignalSource {
    #[zbus(signal, name = "astatus_change")]
    async fn astatus_change(emitter: &SignalEmitter<'_>, service: &str, class: i32, state: &str) -> zbus::Result<()>;

    #[zbus(signal, name = "system_state_change")]
    async fn system_state_change(emitter: &SignalEmitter<'_>, state: i32) -> zbus::Result<()>;

    #[zbus(signal, name = "system_output")]
    async fn system_output(
        emitter: &SignalEmitter<'_>,
        service: &str,
        process_type: &str,
        output: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal, name = "print_error")]
    async fn print_error(emitter: &SignalEmitter<'_>, severity: i32, message: &str) -> zbus::Result<()>;
}

/// Queue side of the bridge, shared by the engine hooks
#[derive(Clone)]
pub struct Bridge {
    tx: mpsc::UnboundedSender<BusSignal>,
    connected: Arc<AtomicBool>,
}

impl Bridge {
    fn send(&self, signal: BusSignal) {
        // The receiver only goes away when the daemon is shutting down
        let _ = self.tx.send(signal);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Subscribe the bridge to the engine
///
/// Returns the receiver to hand to [`run`] and the flag it keeps updated.
pub fn register(engine: &mut Engine) -> (mpsc::UnboundedReceiver<BusSignal>, Arc<AtomicBool>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));
    let bridge = Bridge {
        tx,
        connected: Arc::clone(&connected),
    };

    let b = bridge.clone();
    engine.register_hook::<kind::StateChange, _>(SOURCE, DEFAULT_PRIORITY, move |engine, event| {
        let id = event.payload.service;
        let (Some(service), Some(state)) = (engine.service_name(id), engine.state_of(id)) else {
            return Ok(());
        };
        b.send(BusSignal::StatusChange {
            service: service.to_string(),
            class: state.class.as_i32(),
            state: state.name.clone(),
        });
        Ok(())
    });

    let b = bridge.clone();
    engine.register_hook::<kind::SystemChange, _>(SOURCE, DEFAULT_PRIORITY, move |_, event| {
        b.send(BusSignal::SystemStateChange(event.payload.state.as_i32()));
        Ok(())
    });

    let b = bridge.clone();
    engine.register_hook::<kind::PipeWatcher, _>(SOURCE, DEFAULT_PRIORITY, move |engine, event| {
        // Unclaimed output goes to the log while there is no bus
        if event.is_handled() || !b.is_connected() {
            return Ok(());
        }
        let output = claim_output(engine, event.payload.process, event.payload.pipe);
        if let Some(output) = output {
            let service = engine.service_name(event.payload.service).unwrap_or("?").to_string();
            let process_type = engine.process_type_name(event.payload.process).unwrap_or("?").to_string();
            b.send(BusSignal::SystemOutput {
                service,
                process_type,
                output,
            });
            event.mark_handled();
        }
        Ok(())
    });

    let b = bridge.clone();
    engine.register_hook::<kind::Error, _>(SOURCE, DEFAULT_PRIORITY, move |_, event| {
        b.send(BusSignal::PrintError {
            severity: event.payload.severity.as_i32(),
            message: event.payload.message.clone(),
        });
        Ok(())
    });

    let b = bridge;
    engine.register_hook::<kind::Signal, _>(SOURCE, DEFAULT_PRIORITY, move |_, event| {
        if event.payload.signal == libc::SIGHUP {
            b.send(BusSignal::Reconnect);
        }
        Ok(())
    });

    (rx, connected)
}

/// Take the buffered output of an output pipe
fn claim_output(engine: &mut Engine, process: crate::engine::ProcessId, index: usize) -> Option<String> {
    let pipe = engine.processes_mut().get_mut(process)?.pipes.get_mut(index)?;
    if pipe.direction != PipeDirection::Output || pipe.buffer.is_empty() {
        return None;
    }
    let bytes = std::mem::take(&mut pipe.buffer);
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

async fn connect() -> zbus::Result<Connection> {
    Builder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, SignalSource)?
        .build()
        .await
}

async fn emit(conn: &Connection, signal: &BusSignal) -> zbus::Result<()> {
    let emitter = SignalEmitter::new(conn, OBJECT_PATH)?;
    match signal {
        BusSignal::StatusChange { service, class, state } => {
            SignalSource::astatus_change(&emitter, service, *class, state).await
        }
        BusSignal::SystemStateChange(state) => SignalSource::system_state_change(&emitter, *state).await,
        BusSignal::SystemOutput {
            service,
            process_type,
            output,
        } => SignalSource::system_output(&emitter, service, process_type, output).await,
        BusSignal::PrintError { severity, message } => SignalSource::print_error(&emitter, *severity, message).await,
        BusSignal::Reconnect => Ok(()),
    }
}

/// Own the bus connection until the engine side goes away
///
/// Connecting is retried with exponential backoff; signals queued while
/// there is no connection are dropped.
pub async fn run(mut rx: mpsc::UnboundedReceiver<BusSignal>, connected: Arc<AtomicBool>) {
    let mut conn: Option<Connection> = None;
    let mut attempts = 0;
    let mut delay = Duration::from_millis(500);

    let retry = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(retry);

    loop {
        tokio::select! {
            biased;
            signal = rx.recv() => {
                let Some(signal) = signal else { break };
                if signal == BusSignal::Reconnect {
                    log::info!("Reconnecting to D-Bus");
                    conn = None;
                    connected.store(false, Ordering::Relaxed);
                    attempts = 0;
                    delay = Duration::from_millis(500);
                    retry.as_mut().reset(Instant::now());
                    continue;
                }
                if let Some(c) = &conn {
                    if let Err(e) = emit(c, &signal).await {
                        log::debug!("Unable to send D-Bus signal: {}", e);
                    }
                }
            }
            () = &mut retry, if conn.is_none() && attempts < MAX_ATTEMPTS => {
                match connect().await {
                    Ok(c) => {
                        log::info!("D-Bus signals available from {}", BUS_NAME);
                        conn = Some(c);
                        connected.store(true, Ordering::Relaxed);
                    }
                    Err(e) => {
                        attempts += 1;
                        if attempts >= MAX_ATTEMPTS {
                            log::warn!("Giving up on D-Bus after {} attempts: {}", attempts, e);
                        } else {
                            log::debug!("D-Bus not ready yet (attempt {}): {}, retrying in {:?}", attempts, e, delay);
                        }
                        retry.as_mut().reset(Instant::now() + delay);
                        delay = std::cmp::min(delay * 2, Duration::from_secs(5));
                    }
                }
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::hooks::SignalReceived;
    use crate::engine::{PipeSpec, ProcessSpec, ProcessType, RecordingLauncher, Severity, StateClass, StateDescriptor};
    use crate::config::Config;
    use std::io::Write;

    fn drain(rx: &mut mpsc::UnboundedReceiver<BusSignal>) -> Vec<BusSignal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    #[test]
    fn test_state_and_error_signals() {
        let mut engine = Engine::new(Config::default(), Box::new(RecordingLauncher::new()));
        let (mut rx, _) = register(&mut engine);
        let down = engine
            .states_mut()
            .register(StateDescriptor::new("STOPPED", "", StateClass::Down));
        let up = engine
            .states_mut()
            .register(StateDescriptor::new("RUNNING", "", StateClass::Up));

        let id = engine.create_service("daemon/sshd", down, None, None).unwrap();
        engine.mark_service(id, up).unwrap();
        engine.report(Severity::Fail, "sshd is unhappy");
        engine.dispatch::<kind::Signal>(SignalReceived { signal: libc::SIGHUP });

        assert_eq!(
            drain(&mut rx),
            vec![
                BusSignal::StatusChange {
                    service: "daemon/sshd".into(),
                    class: StateClass::Up.as_i32(),
                    state: "RUNNING".into(),
                },
                BusSignal::PrintError {
                    severity: Severity::Fail.as_i32(),
                    message: "sshd is unhappy".into(),
                },
                BusSignal::Reconnect,
            ]
        );
    }

    #[test]
    fn test_output_claimed_only_when_connected() {
        let launcher = RecordingLauncher::new();
        let mut engine = Engine::new(Config::default(), Box::new(launcher.clone()));
        let (mut rx, connected) = register(&mut engine);
        let up = engine
            .states_mut()
            .register(StateDescriptor::new("RUNNING", "", StateClass::Up));
        let ptype = engine.register_process_type(ProcessType::new("daemon-process"));
        let id = engine.create_service("daemon/sshd", up, None, None).unwrap();
        let spec = ProcessSpec::new(vec!["/usr/sbin/sshd".into()]).pipe(PipeSpec::new(PipeDirection::Output, &[1, 2]));
        engine.spawn_bound(id, ptype, spec).unwrap();
        let pid = launcher.last_pid().unwrap();
        let mut child = std::fs::File::from(launcher.take_child_fd(pid, 1).unwrap());

        child.write_all(b"nobody listening\n").unwrap();
        let fds = engine.io_check();
        engine.io_call(fds);
        assert!(drain(&mut rx).is_empty());

        connected.store(true, Ordering::Relaxed);
        child.write_all(b"Server listening on :: port 22.\n").unwrap();
        let fds = engine.io_check();
        engine.io_call(fds);
        assert_eq!(
            drain(&mut rx),
            vec![BusSignal::SystemOutput {
                service: "daemon/sshd".into(),
                process_type: "daemon-process".into(),
                output: "Server listening on :: port 22.\n".into(),
            }]
        );
    }

    #[test]
    fn test_run_stops_when_engine_side_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        drop(tx);
        tokio_test::block_on(run(rx, Arc::clone(&connected)));
        assert!(!connected.load(Ordering::Relaxed));
    }
}
