//! nginitctl - describe services to nginit
//!
//! Service scripts run this while nginit parses them. During `internal_setup`
//! the daemon hands the script a socket on fd 3 and that is used; otherwise
//! requests go to the control socket. `SERVICE` and `SERVICE_FILE` from the
//! environment fill in the service name and origin.

use clap::{Parser, Subcommand};
use std::env;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use nginit::config::Config;
use nginit::protocol::{self, Reply, Request, RequestBody, SETUP_FD};

#[derive(Parser)]
#[command(name = "nginitctl")]
#[command(about = "Describe services to the nginit daemon")]
struct Args {
    /// Control socket to use when not running under a service script
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a service of a type
    Register {
        /// Service type (service, daemon, virtual)
        service_type: String,
        /// Service name, defaults to $SERVICE
        name: Option<String>,
    },

    /// Set a variable
    Set {
        /// Variable type (exec, exec_args, env, ...)
        var_type: String,
        /// Value words, joined by spaces
        value: Vec<String>,
        /// Sub-name of keyed variables
        #[arg(short = 'n', long = "name")]
        var_name: Option<String>,
        /// Service, defaults to $SERVICE
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Print a variable
    Get {
        var_type: String,
        #[arg(short = 'n', long = "name")]
        var_name: Option<String>,
        #[arg(short, long)]
        service: Option<String>,
    },

    /// The description is complete, start the service
    Done {
        service: Option<String>,
    },

    /// The description failed
    Abort {
        service: Option<String>,
    },
}

fn service_or_env(service: Option<String>) -> String {
    service.or_else(|| env::var("SERVICE").ok()).unwrap_or_default()
}

/// The socket the daemon handed us on fd 3, if there is one
fn setup_socket() -> Option<UnixStream> {
    if !protocol::is_socket(SETUP_FD) {
        return None;
    }
    // SAFETY: fd 3 was inherited from the daemon and nothing else here owns it
    Some(unsafe { UnixStream::from_raw_fd(SETUP_FD) })
}

fn call(socket: Option<PathBuf>, request: &Request) -> Result<Reply, protocol::ProtocolError> {
    if let Some(mut stream) = setup_socket() {
        return protocol::call(&mut stream, request);
    }
    let path = socket.unwrap_or_else(|| Config::default().socket_path);
    protocol::call_socket(&path, request)
}

fn main() {
    let args = Args::parse();

    let print_message = matches!(args.command, Command::Get { .. });
    let body = match args.command {
        Command::Register { service_type, name } => RequestBody::CreateService {
            service_type,
            name: service_or_env(name),
            origin: env::var("SERVICE_FILE").unwrap_or_default(),
        },
        Command::Set {
            var_type,
            value,
            var_name,
            service,
        } => RequestBody::SetVariable {
            service: service_or_env(service),
            var_type,
            var_name,
            value: (!value.is_empty()).then(|| value.join(" ")),
        },
        Command::Get {
            var_type,
            var_name,
            service,
        } => RequestBody::GetVariable {
            service: service_or_env(service),
            var_type,
            var_name,
        },
        Command::Done { service } => RequestBody::Done {
            service: service_or_env(service),
        },
        Command::Abort { service } => RequestBody::Abort {
            service: service_or_env(service),
        },
    };

    match call(args.socket, &Request::new(body)) {
        Ok(reply) if reply.success => {
            if print_message && !reply.message.is_empty() {
                println!("{}", reply.message);
            }
        }
        Ok(reply) => {
            if !reply.message.is_empty() {
                eprintln!("nginitctl: {}", reply.message);
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("nginitctl: {}", e);
            std::process::exit(1);
        }
    }
}
