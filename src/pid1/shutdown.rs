//! Shutdown sequence for PID 1
//!
//! Runs once the engine reached HALT, POWEROFF or REBOOT and every service
//! has settled:
//! 1. SIGTERM to every remaining process, then SIGKILL to stragglers
//! 2. Sync and unmount filesystems
//! 3. The reboot() syscall

use nix::sys::reboot::{reboot, RebootMode};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{sync, Pid};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

use crate::engine::SystemState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    Poweroff,
    Reboot,
    /// Stop, don't power off
    Halt,
}

impl ShutdownType {
    /// The shutdown a final system state asks for; EXIT just leaves
    pub fn for_state(state: SystemState) -> Option<Self> {
        match state {
            SystemState::Poweroff => Some(Self::Poweroff),
            SystemState::Reboot => Some(Self::Reboot),
            SystemState::Halt => Some(Self::Halt),
            _ => None,
        }
    }

    fn to_reboot_mode(self) -> RebootMode {
        match self {
            ShutdownType::Poweroff => RebootMode::RB_POWER_OFF,
            ShutdownType::Reboot => RebootMode::RB_AUTOBOOT,
            ShutdownType::Halt => RebootMode::RB_HALT_SYSTEM,
        }
    }
}

/// Execute shutdown sequence
pub async fn shutdown(shutdown_type: ShutdownType) -> ! {
    log::info!("Initiating {:?} sequence", shutdown_type);

    terminate_all_processes().await;

    log::info!("Syncing filesystems");
    sync();
    unmount_filesystems();
    sync();

    log::info!("Executing {:?}", shutdown_type);

    let Err(e) = reboot(shutdown_type.to_reboot_mode());
    log::error!("reboot() failed: {}", e);
    // PID 1 can't exit
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Send SIGTERM then SIGKILL to all processes
async fn terminate_all_processes() {
    log::info!("Sending SIGTERM to all processes");
    let _ = kill(Pid::from_raw(-1), Signal::SIGTERM);

    sleep(Duration::from_secs(5)).await;

    log::info!("Sending SIGKILL to remaining processes");
    let _ = kill(Pid::from_raw(-1), Signal::SIGKILL);

    sleep(Duration::from_millis(100)).await;
    super::reap();
}

/// Mount points from /proc/mounts that may be unmounted, innermost first
fn unmount_order(mounts: &str) -> Vec<String> {
    let skip = ["/", "/proc", "/sys", "/dev"];
    let mut points: Vec<String> = mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|point| !skip.contains(point))
        .map(str::to_string)
        .collect();
    points.reverse();
    points
}

fn unmount_filesystems() {
    log::info!("Unmounting filesystems");

    let mounts = match fs::read_to_string("/proc/mounts") {
        Ok(m) => m,
        Err(e) => {
            log::error!("Cannot read /proc/mounts: {}", e);
            return;
        }
    };

    for mount_point in unmount_order(&mounts) {
        let path = Path::new(&mount_point);
        log::debug!("Unmounting {}", mount_point);

        if let Err(e) = nix::mount::umount(path) {
            log::debug!("Normal unmount failed for {}: {}, trying lazy", mount_point, e);
            if let Err(e) = nix::mount::umount2(path, nix::mount::MntFlags::MNT_DETACH) {
                log::warn!("Failed to unmount {}: {}", mount_point, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_state() {
        assert_eq!(ShutdownType::for_state(SystemState::Reboot), Some(ShutdownType::Reboot));
        assert_eq!(ShutdownType::for_state(SystemState::Halt), Some(ShutdownType::Halt));
        assert_eq!(ShutdownType::for_state(SystemState::Exit), None);
        assert_eq!(ShutdownType::for_state(SystemState::Up), None);
    }

    #[test]
    fn test_unmount_order() {
        let mounts = "\
/dev/sda1 / ext4 rw 0 0
proc /proc proc rw 0 0
/dev/sda2 /home ext4 rw 0 0
tmpfs /home/user/tmp tmpfs rw 0 0
";
        assert_eq!(unmount_order(mounts), vec!["/home/user/tmp", "/home"]);
    }
}
