//! # Appkit - Pluggable Module Runtime
//!
//! Assemble a server from independently written modules. Each module declares
//! its identity, dependencies and what it contributes (entities, routes, event
//! handlers, services); the [`Application`] orders modules by dependency and
//! drives them through a fixed lifecycle:
//!
//! core services → initialize → schema sync → contracts → seed → event bus →
//! start → serve → stop (reverse order).
//!
//! ## Basic Module Example
//!
//! ```rust,ignore
//! use appkit::{async_trait, Module, ModuleCtx};
//! use std::any::Any;
//!
//! #[derive(Default)]
//! pub struct Reports;
//!
//! #[async_trait]
//! impl Module for Reports {
//!     fn name(&self) -> &str { "reports" }
//!     fn version(&self) -> &str { "0.1.0" }
//!     fn dependencies(&self) -> Vec<&str> { vec!["users"] }
//!
//!     async fn initialize(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
//!         let cfg: ReportsConfig = ctx.config()?;
//!         // ...
//!         Ok(())
//!     }
//!
//!     fn as_any(&self) -> &dyn Any { self }
//! }
//! ```
//!
//! ## Running
//!
//! ```rust,ignore
//! let mut app = Application::new(config);
//! app.register(Arc::new(Reports))?;
//! app.run(ShutdownOptions::Signals).await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod auth;
pub mod context;
pub mod contracts;
pub mod events;
pub mod http;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod storage;

pub use appkit_bootstrap::{AppConfig, ConfigProvider};

pub use auth::{require_auth, AuthError, AuthProvider, DisabledAuth, Principal, StaticTokenAuth};
pub use context::{ModuleContextBuilder, ModuleCtx};
pub use contracts::*;
pub use events::{Event, EventBus, EventBusError, EventHandler, EventPayload, PublishReport};
pub use http::{Problem, RouteError, RouteTable};
pub use registry::{
    HookTimeout, ModuleRegistry, ModuleState, ModuleStopError, RegistryError, StopReport,
};
pub use runtime::{
    Application, BootstrapError, Phase, RunningApplication, ShutdownOptions, ShutdownReport,
    StorageOptions,
};
pub use services::{ServiceError, ServiceHandle, ServiceRegistry};
pub use storage::{MemoryStorage, SqlStorage, SqlTable, Storage, StorageError};
