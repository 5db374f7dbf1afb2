//! Built-in plugins
//!
//! Each plugin only talks to the engine through registries and hooks.

pub mod initctl;
pub mod service_file;
pub mod service_types;

use crate::engine::Engine;

/// Register every built-in plugin the configuration asks for
pub fn register_builtin(engine: &mut Engine) {
    service_types::register(engine);
    service_file::register(engine);
    if engine.config().initctl {
        initctl::register(engine);
    }
}
