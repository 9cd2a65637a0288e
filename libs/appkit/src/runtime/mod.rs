mod application;
mod phase;
mod runner;
mod shutdown;

pub use application::{Application, RunningApplication, StorageOptions};
pub use phase::{Phase, PhaseTracker};
pub use runner::ShutdownOptions;
pub use shutdown::{ShutdownReport, StepOutcome};

use thiserror::Error;

use crate::events::EventBusError;
use crate::http::RouteError;
use crate::registry::RegistryError;
use crate::storage::StorageError;

/// Fatal startup failures. Anything listed here aborts the boot sequence.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("invalid configuration")]
    Config(#[source] anyhow::Error),

    #[error("failed to open storage")]
    Storage(#[source] StorageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("module '{module}' declares an invalid event handler")]
    Subscribe {
        module: String,
        #[source]
        source: EventBusError,
    },

    #[error("table '{table}' is declared by both '{first}' and '{second}'")]
    DuplicateEntity {
        table: String,
        first: String,
        second: String,
    },

    #[error("schema sync failed")]
    SchemaSync(#[source] StorageError),

    #[error("seeding failed for module '{module}'")]
    Seed {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("event bus failed to start")]
    EventBus(#[source] EventBusError),

    #[error(transparent)]
    Routes(#[from] RouteError),

    #[error("failed to bind HTTP listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl BootstrapError {
    /// The module the failure is attributed to, when there is one.
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::Subscribe { module, .. } | Self::Seed { module, .. } => Some(module),
            Self::DuplicateEntity { second, .. } => Some(second),
            Self::Registry(e) => e.module(),
            Self::Routes(e) => e.module(),
            _ => None,
        }
    }
}
