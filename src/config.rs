//! Runtime configuration
//!
//! Defaults match a stock installation; the daemon overrides them from its
//! command line.

use std::path::PathBuf;
use std::time::Duration;

/// Directory holding the control socket
pub const SOCKET_DIR: &str = "/dev/initng";

#[derive(Debug, Clone)]
pub struct Config {
    /// Control socket for service-file requests
    pub socket_path: PathBuf,
    /// Where service scripts live; `getty/tty1` is looked up as `<dir>/getty`
    pub script_dir: PathBuf,
    /// sysvinit compatible control FIFO
    pub initctl_path: PathBuf,
    /// Service started at boot
    pub runlevel: String,
    /// Extra services started at boot after the runlevel
    pub extra_services: Vec<String>,
    /// PATH handed to every child
    pub path_env: String,
    /// How long a service script may take to describe a service
    pub parse_timeout: Duration,
    /// Default time a start process may run before it is killed
    pub start_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when stopping
    pub stop_timeout: Duration,
    pub dbus: bool,
    pub initctl: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_DIR).join("initng-service-file.socket"),
            script_dir: PathBuf::from("/etc/initng"),
            initctl_path: PathBuf::from("/dev/initctl"),
            runlevel: "default".to_string(),
            extra_services: Vec::new(),
            path_env: "/bin:/sbin:/usr/bin:/usr/sbin".to_string(),
            parse_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            dbus: true,
            initctl: true,
        }
    }
}

impl Config {
    /// Split kernel-style arguments: `+name` adds an extra service, anything
    /// else without a leading dash is ignored
    pub fn add_extra_services<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            if let Some(name) = arg.as_ref().strip_prefix('+') {
                if !name.is_empty() {
                    self.extra_services.push(name.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.script_dir, PathBuf::from("/etc/initng"));
        assert!(config.socket_path.starts_with(SOCKET_DIR));
        assert_eq!(config.runlevel, "default");
    }

    #[test]
    fn test_extra_services() {
        let mut config = Config::default();
        config.add_extra_services(["+getty/tty2", "quiet", "+", "+daemon/sshd"]);
        assert_eq!(config.extra_services, vec!["getty/tty2", "daemon/sshd"]);
    }
}
