//! nginit - next generation init
//!
//! A service supervisor built around a small synchronous core:
//! - Active-service registry keyed by exact name
//! - State machine with per-state init, interrupt and alarm callbacks
//! - Event hooks every plugin hangs off (state changes, process exits, pipe
//!   output, signals, I/O watchers, error messages)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    daemon                        │
//! ├──────────────┬───────────────┬───────────────────┤
//! │ service_file │ initctl FIFO  │  D-Bus bridge     │
//! ├──────────────┴───────────────┴───────────────────┤
//! │ engine: states · services · processes · hooks    │
//! ├──────────────────────────────────────────────────┤
//! │               list · hash                        │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod dbus;
pub mod engine;
pub mod hash;
pub mod list;
pub mod pid1;
pub mod plugins;
pub mod protocol;

pub use config::Config;
pub use engine::{Engine, EngineError};
