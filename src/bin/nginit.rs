//! nginit - next generation init daemon
//!
//! Boots the configured runlevel service plus any `+name` services given on
//! the command line, serves service-file requests on the control socket and
//! broadcasts its events on D-Bus.
//!
//! When running as PID 1 the final system state (halt, poweroff, reboot) is
//! carried out once every service is down.

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

use nginit::config::Config;
use nginit::engine::{CommandLauncher, Engine, Launcher, RecordingLauncher};
use nginit::pid1::{self, ShutdownType};
use nginit::{daemon, plugins};

#[derive(Parser)]
#[command(name = "nginit")]
#[command(about = "Next generation init daemon")]
struct Args {
    /// Service started at boot
    #[arg(long)]
    runlevel: Option<String>,

    /// Directory holding service scripts
    #[arg(long)]
    script_dir: Option<PathBuf>,

    /// Control socket for service-file requests
    #[arg(long)]
    socket: Option<PathBuf>,

    /// sysvinit control FIFO
    #[arg(long)]
    initctl: Option<PathBuf>,

    /// Seconds a service script may take to describe a service
    #[arg(long)]
    parse_timeout: Option<u64>,

    /// Default seconds a start process may run
    #[arg(long)]
    start_timeout: Option<u64>,

    /// Seconds between SIGTERM and SIGKILL when stopping
    #[arg(long)]
    stop_timeout: Option<u64>,

    /// Don't broadcast events on D-Bus
    #[arg(long)]
    no_dbus: bool,

    /// Don't listen on the initctl FIFO
    #[arg(long)]
    no_initctl: bool,

    /// Record launches instead of running anything
    #[arg(long)]
    dry_run: bool,

    /// Kernel command line words; `+name` starts `name` at boot
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::default();
        if let Some(runlevel) = &self.runlevel {
            config.runlevel = runlevel.clone();
        }
        if let Some(dir) = &self.script_dir {
            config.script_dir = dir.clone();
        }
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(initctl) = &self.initctl {
            config.initctl_path = initctl.clone();
        }
        if let Some(secs) = self.parse_timeout {
            config.parse_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.start_timeout {
            config.start_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.stop_timeout {
            config.stop_timeout = Duration::from_secs(secs);
        }
        config.dbus = !self.no_dbus;
        config.initctl = !self.no_initctl;
        config.add_extra_services(&self.args);
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let is_pid1 = pid1::is_pid1();
    let config = args.config();
    info!(
        "nginit starting{} with runlevel {}",
        if is_pid1 { " as PID 1" } else { "" },
        config.runlevel
    );

    let launcher: Box<dyn Launcher> = if args.dry_run {
        info!("Dry run, nothing will be launched");
        Box::new(RecordingLauncher::new())
    } else {
        Box::new(CommandLauncher)
    };

    let mut engine = Engine::new(config, launcher);
    plugins::register_builtin(&mut engine);

    let state = daemon::run(engine, is_pid1).await?;

    match ShutdownType::for_state(state) {
        Some(shutdown) if is_pid1 => pid1::shutdown(shutdown).await,
        Some(shutdown) => info!("Not PID 1, skipping {:?}", shutdown),
        None => {}
    }
    Ok(())
}
