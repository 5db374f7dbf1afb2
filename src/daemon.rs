//! Daemon main loop
//!
//! The engine is synchronous and owned by this loop. Each round runs the
//! pending state interrupts, then waits for whichever comes first: a signal,
//! a decoded control request, a watched descriptor becoming readable or the
//! next state alarm.
//!
//! Control connections never block the loop. Each one gets its own task that
//! reads the request, hands it over with a reply channel and writes the reply.

use std::fs::{self, DirBuilder, Permissions};
use std::future::{pending, poll_fn};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use std::task::Poll;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};

use crate::dbus;
use crate::engine::hooks::SignalReceived;
use crate::engine::{kind, Engine, FdSet, SystemState};
use crate::pid1::{self, SignalAction, HANDLED_SIGNALS};
use crate::plugins::service_file;
use crate::protocol::{self, ProtocolError, Reply, Request};

/// How long a control connection may take to send its request or take its reply
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A request read off a control connection, waiting for the engine
struct ControlRequest {
    request: Result<Request, ProtocolError>,
    reply: oneshot::Sender<Reply>,
}

enum Wake {
    Signal(Option<i32>),
    Connection(io::Result<UnixStream>),
    Request(Option<ControlRequest>),
    Readable(FdSet),
    Alarm,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
}

/// Run until the system reaches a final state and return it
pub async fn run(mut engine: Engine, is_pid1: bool) -> Result<SystemState, DaemonError> {
    let mut signals = pid1::forward_signals(&HANDLED_SIGNALS).map_err(DaemonError::Signals)?;

    if engine.config().dbus {
        let (rx, connected) = dbus::register(&mut engine);
        tokio::spawn(dbus::run(rx, connected));
    }

    let socket_path = engine.config().socket_path.clone();
    let listener = match bind_control_socket(&socket_path) {
        Ok(l) => {
            log::info!("Listening on {}", socket_path.display());
            Some(l)
        }
        Err(e) => {
            log::error!("Failed to bind {}: {}", socket_path.display(), e);
            None
        }
    };
    let (request_tx, mut requests) = mpsc::channel::<ControlRequest>(32);

    engine.boot();

    let state = loop {
        engine.run_interrupts();
        let state = engine.system_state();
        if state.is_final() {
            break state;
        }

        let watched = watch(engine.io_check());
        let alarm = engine.next_alarm().map(Instant::from_std);

        let wake = tokio::select! {
            sig = signals.recv() => Wake::Signal(sig),
            conn = accept(listener.as_ref()) => Wake::Connection(conn),
            request = requests.recv() => Wake::Request(request),
            ready = readable(&watched) => Wake::Readable(ready),
            () = sleep_or_pending(alarm) => Wake::Alarm,
        };
        drop(watched);

        match wake {
            Wake::Signal(Some(sig)) => handle_signal(&mut engine, sig, is_pid1),
            Wake::Signal(None) => {
                log::error!("Signal forwarder stopped");
                break engine.system_state();
            }
            Wake::Connection(Ok(stream)) => {
                tokio::spawn(serve_connection(stream, request_tx.clone()));
            }
            Wake::Connection(Err(e)) => log::error!("accept error: {}", e),
            Wake::Request(Some(ControlRequest { request, reply })) => {
                let answer = service_file::answer(&mut engine, request);
                if reply.send(answer).is_err() {
                    log::debug!("Control connection went away before its reply");
                }
            }
            // The loop holds a sender, so the queue never closes
            Wake::Request(None) => {}
            Wake::Readable(ready) => {
                engine.io_call(ready);
            }
            Wake::Alarm => {
                engine.run_alarms(std::time::Instant::now());
            }
        }
    };

    log::info!("System reached {}", state);
    engine.io_close();
    if listener.is_some() {
        let _ = fs::remove_file(&socket_path);
    }
    Ok(state)
}

/// The SIGNAL dispatch comes first, then the daemon's own handling
pub fn handle_signal(engine: &mut Engine, sig: i32, is_pid1: bool) {
    engine.dispatch::<kind::Signal>(SignalReceived { signal: sig });

    match SignalAction::for_signal(sig, is_pid1) {
        SignalAction::Reap => {
            for (pid, status) in pid1::reap() {
                engine.process_exited(pid, status);
            }
        }
        SignalAction::StopAll(when_out) => {
            log::info!("Received signal {}, stopping all services ({:?})", sig, when_out);
            engine.set_when_out(when_out);
            engine.stop_all();
        }
        SignalAction::Dump => {
            log::info!("Received SIGUSR1, dumping state\n{}", engine.dump());
        }
        SignalAction::SubscribersOnly => {}
    }
}

/// Create the socket directory (0700) and bind the socket (0600)
fn bind_control_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
        fs::set_permissions(dir, Permissions::from_mode(0o700))?;
    }
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, Permissions::from_mode(0o600))?;
    Ok(listener)
}

async fn accept(listener: Option<&UnixListener>) -> io::Result<UnixStream> {
    match listener {
        Some(l) => l.accept().await.map(|(stream, _)| stream),
        None => pending().await,
    }
}

/// One request, one reply, with the engine's part done by the main loop
async fn serve_connection(mut stream: UnixStream, requests: mpsc::Sender<ControlRequest>) {
    let request = match timeout(REQUEST_TIMEOUT, protocol::read_message_async::<_, Request>(&mut stream)).await {
        Ok(r) => r,
        Err(_) => {
            log::warn!("Control connection sent no request in time");
            return;
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let queued = ControlRequest {
        request,
        reply: reply_tx,
    };
    if requests.send(queued).await.is_err() {
        return;
    }
    let Ok(reply) = reply_rx.await else {
        return;
    };

    match timeout(REQUEST_TIMEOUT, protocol::write_message_async(&mut stream, &reply)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Failed to send reply: {}", e),
        Err(_) => log::warn!("Control connection did not take its reply"),
    }
}

fn watch(fds: FdSet) -> Vec<AsyncFd<RawFd>> {
    fds.into_iter()
        .filter_map(|fd| match AsyncFd::with_interest(fd, Interest::READABLE) {
            Ok(w) => Some(w),
            Err(e) => {
                log::warn!("Can't watch descriptor {}: {}", fd, e);
                None
            }
        })
        .collect()
}

/// Wait until at least one watched descriptor is readable
async fn readable(watched: &[AsyncFd<RawFd>]) -> FdSet {
    if watched.is_empty() {
        return pending().await;
    }
    poll_fn(|cx| {
        let mut ready = FdSet::new();
        for w in watched {
            match w.poll_read_ready(cx) {
                Poll::Ready(Ok(mut guard)) => {
                    guard.clear_ready();
                    ready.insert(*w.get_ref());
                }
                // Let the owner find out what is wrong
                Poll::Ready(Err(_)) => {
                    ready.insert(*w.get_ref());
                }
                Poll::Pending => {}
            }
        }
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    })
    .await
}

async fn sleep_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => pending().await,
    }
}
