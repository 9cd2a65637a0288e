use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::context::ModuleCtx;
use crate::events::EventHandler;
use crate::services::ServiceHandle;

/// A feature unit assembled into the application.
///
/// Lifecycle, driven by the registry in dependency order:
/// `initialize` → (schema sync, seeding) → `start` → ... → `stop` (reverse order).
/// Every method except `name`, `version` and `as_any` has a no-op default so a
/// module only spells out what it actually provides.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Unique, immutable identity.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Names of modules that must be initialized and started before this one.
    fn dependencies(&self) -> Vec<&str> {
        Vec::new()
    }

    /// Wiring: read config, build services. Storage schema is NOT synced yet.
    async fn initialize(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after schema sync, seeding and bus start.
    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs in reverse dependency order during shutdown, at most once.
    async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    fn entities(&self) -> Vec<EntityDescriptor> {
        Vec::new()
    }

    fn routes(&self) -> Vec<Arc<dyn RouteProvider>> {
        Vec::new()
    }

    fn event_handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        Vec::new()
    }

    fn services(&self) -> Vec<Arc<dyn ServiceProvider>> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;

    /// Return self as a Seeder if this module loads baseline data.
    fn as_seeder(&self) -> Option<&dyn Seeder> {
        None
    }

    /// Return self as a ContractRegistrar if this module registers contracts.
    fn as_contract_registrar(&self) -> Option<&dyn ContractRegistrar> {
        None
    }
}

/// Loads baseline reference data. Runs after schema sync; a failure is fatal.
#[async_trait]
pub trait Seeder: Send + Sync {
    async fn seed(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;
}

/// Registers module-specific contracts (document schemas and the like).
/// Best-effort: a failure is logged and startup continues.
#[async_trait]
pub trait ContractRegistrar: Send + Sync {
    /// Returns how many contracts were registered.
    async fn register_contracts(&self, ctx: &ModuleCtx) -> anyhow::Result<usize>;
}

/// A group of HTTP endpoints mounted under a common prefix.
pub trait RouteProvider: Send + Sync {
    /// Mount point, e.g. `/users`. Empty or `/` merges at the root.
    fn prefix(&self) -> &str;

    /// Applied to this group only, in order.
    fn middleware(&self) -> Vec<Middleware> {
        Vec::new()
    }

    /// Pure wiring; must not block.
    fn register_routes(&self, router: Router, ctx: &ModuleCtx) -> anyhow::Result<Router>;
}

/// A named router transformation (usually one or more `layer` calls).
#[derive(Clone)]
pub struct Middleware {
    name: &'static str,
    apply: Arc<dyn Fn(Router) -> Router + Send + Sync>,
}

impl Middleware {
    pub fn new<F>(name: &'static str, apply: F) -> Self
    where
        F: Fn(Router) -> Router + Send + Sync + 'static,
    {
        Self {
            name,
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, router: Router) -> Router {
        (self.apply)(router)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware").field("name", &self.name).finish()
    }
}

/// Storage model behind an entity. Opaque to the runtime; only the storage
/// backend asks it for statements.
pub trait EntityModel: Send + Sync {
    /// Idempotent statements that create or additively extend `table`.
    fn schema_statements(&self, table: &str) -> Vec<String>;
}

/// An entity a module wants present in the shared store.
#[derive(Clone)]
pub struct EntityDescriptor {
    table: String,
    model: Arc<dyn EntityModel>,
}

impl EntityDescriptor {
    pub fn new(table: impl Into<String>, model: impl EntityModel + 'static) -> Self {
        Self {
            table: table.into(),
            model: Arc::new(model),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn model(&self) -> &dyn EntityModel {
        self.model.as_ref()
    }

    pub fn schema_statements(&self) -> Vec<String> {
        self.model.schema_statements(&self.table)
    }
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

/// Produces a capability object published in the service registry under `name`.
pub trait ServiceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, ctx: &ModuleCtx) -> anyhow::Result<ServiceHandle>;
}

type ServiceFactory = dyn Fn(&ModuleCtx) -> anyhow::Result<ServiceHandle> + Send + Sync;

/// Closure-backed [`ServiceProvider`].
pub struct FnServiceProvider {
    name: String,
    factory: Box<ServiceFactory>,
}

impl FnServiceProvider {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ModuleCtx) -> anyhow::Result<ServiceHandle> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
        }
    }
}

impl ServiceProvider for FnServiceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, ctx: &ModuleCtx) -> anyhow::Result<ServiceHandle> {
        (self.factory)(ctx)
    }
}
