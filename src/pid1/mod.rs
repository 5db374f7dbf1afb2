//! PID 1 functionality
//!
//! Handles responsibilities specific to running as init (PID 1):
//! - Signal forwarding into the daemon loop
//! - Child reaping
//! - Orderly shutdown

mod reaper;
mod shutdown;
mod signals;

pub use reaper::{exit_status, reap};
pub use shutdown::{shutdown, ShutdownType};
pub use signals::{forward as forward_signals, SignalAction, HANDLED_SIGNALS};

use std::process;

/// Check if we are running as PID 1
pub fn is_pid1() -> bool {
    process::id() == 1
}
