//! Child reaping
//!
//! Services are our children and orphans get reparented to PID 1, so every
//! SIGCHLD drains all exited children with `waitpid(WNOHANG)`.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::engine::ExitStatus;

/// Map a wait status to a final exit, `None` for stop/continue reports
pub fn exit_status(status: WaitStatus) -> Option<(Pid, ExitStatus)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, ExitStatus::Exited(code))),
        WaitStatus::Signaled(pid, signal, _) => Some((pid, ExitStatus::Signaled(signal as i32))),
        _ => None,
    }
}

/// Reap every exited child without blocking
pub fn reap() -> Vec<(Pid, ExitStatus)> {
    let mut reaped = Vec::new();

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some((pid, exit)) = exit_status(status) {
                    log::debug!("Reaped PID {} ({:?})", pid, exit);
                    reaped.push((pid, exit));
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                log::error!("waitpid error: {}", e);
                break;
            }
        }
    }

    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn test_exit_status_mapping() {
        let pid = Pid::from_raw(1234);
        assert_eq!(
            exit_status(WaitStatus::Exited(pid, 3)),
            Some((pid, ExitStatus::Exited(3)))
        );
        assert_eq!(
            exit_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some((pid, ExitStatus::Signaled(9)))
        );
        assert_eq!(exit_status(WaitStatus::Continued(pid)), None);
        assert_eq!(exit_status(WaitStatus::StillAlive), None);
    }
}
