//! Signals the daemon acts on
//!
//! Every handled signal gets its own stream task feeding one queue, so the
//! main loop sees plain signal numbers in arrival order. What the loop does
//! with a number, after SIGNAL subscribers have seen it, is a [`SignalAction`].

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::engine::WhenOut;

/// Signals the daemon listens for
pub const HANDLED_SIGNALS: [i32; 5] = [libc::SIGCHLD, libc::SIGTERM, libc::SIGINT, libc::SIGHUP, libc::SIGUSR1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Reap children and feed their exits to the engine
    Reap,
    /// Stop every service, then carry out the exit action
    StopAll(WhenOut),
    /// Log a dump of services and watched descriptors
    Dump,
    /// Nothing beyond the SIGNAL subscribers (SIGHUP reopens and reconnects there)
    SubscribersOnly,
}

impl SignalAction {
    pub fn for_signal(sig: i32, is_pid1: bool) -> Self {
        match sig {
            libc::SIGCHLD => Self::Reap,
            libc::SIGTERM if is_pid1 => Self::StopAll(WhenOut::Poweroff),
            libc::SIGTERM => Self::StopAll(WhenOut::Exit),
            libc::SIGINT => Self::StopAll(WhenOut::Reboot),
            libc::SIGUSR1 => Self::Dump,
            _ => Self::SubscribersOnly,
        }
    }
}

/// Install handlers for `signals` and queue their numbers as they arrive
///
/// Must run inside a tokio runtime. Handlers are installed before anything is
/// spawned, so an error leaves no task behind.
pub fn forward(signals: &[i32]) -> io::Result<mpsc::Receiver<i32>> {
    let streams = signals
        .iter()
        .map(|&sig| signal(SignalKind::from_raw(sig)).map(|stream| (sig, stream)))
        .collect::<io::Result<Vec<_>>>()?;

    let (tx, rx) = mpsc::channel(32);
    for (sig, mut stream) in streams {
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(rx)
}
