//! Process bootstrap for appkit servers: layered configuration, logging
//! and OS signal handling.

pub mod config;
pub mod config_provider;
pub mod logging;
pub mod paths;
pub mod signals;

pub use config::*;
pub use config_provider::*;
pub use logging::*;
pub use signals::*;
