use std::sync::{Arc, Weak};

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use appkit_bootstrap::ConfigProvider;

use crate::auth::{AuthProvider, DisabledAuth};
use crate::events::EventBus;
use crate::http::RouteTable;
use crate::registry::ModuleRegistry;
use crate::services::ServiceRegistry;
use crate::storage::{MemoryStorage, Storage};

/// Infrastructure shared by every module of one application.
struct SharedInfra {
    config: Arc<dyn ConfigProvider>,
    storage: Arc<dyn Storage>,
    routes: Arc<RouteTable>,
    events: Arc<EventBus>,
    services: Arc<ServiceRegistry>,
    auth: Arc<dyn AuthProvider>,
    registry: Weak<ModuleRegistry>,
    cancel: CancellationToken,
}

/// Handle a module receives in its hooks. Cheap to clone.
///
/// The same infrastructure is seen by every module; only `module_name`
/// (and therefore `config`) differs between per-module views.
#[derive(Clone)]
pub struct ModuleCtx {
    module: Arc<str>,
    shared: Arc<SharedInfra>,
}

impl std::fmt::Debug for ModuleCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCtx")
            .field("module", &self.module)
            .field("storage", &self.shared.storage.backend())
            .finish_non_exhaustive()
    }
}

impl ModuleCtx {
    /// Same infrastructure, scoped to `module` for config lookups and logging.
    pub fn for_module(&self, module: &str) -> Self {
        Self {
            module: Arc::from(module),
            shared: self.shared.clone(),
        }
    }

    /// Empty for the application-level context.
    pub fn module_name(&self) -> &str {
        &self.module
    }

    /// This module's config section, or `T::default()` when absent.
    pub fn config<T: DeserializeOwned + Default>(&self) -> anyhow::Result<T> {
        match self.shared.config.get_module_config(&self.module) {
            Some(value) => serde_json::from_value(value.clone()).with_context(|| {
                format!("invalid configuration for module '{}'", self.module)
            }),
            None => Ok(T::default()),
        }
    }

    /// This module's config section as raw JSON (`Null` when absent).
    pub fn raw_config(&self) -> serde_json::Value {
        self.shared
            .config
            .get_module_config(&self.module)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn config_provider(&self) -> &Arc<dyn ConfigProvider> {
        &self.shared.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.shared.storage
    }

    /// Connection pool of the relational store, if that is what backs storage.
    pub fn sql_pool(&self) -> anyhow::Result<sqlx::AnyPool> {
        crate::storage::sql_pool_of(self.shared.storage.as_ref())
            .ok_or_else(|| anyhow::anyhow!("storage backend '{}' has no SQL pool", self.shared.storage.backend()))
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.shared.routes
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.shared.services
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.shared.auth
    }

    /// Back-reference to the module registry; `None` once the application is gone.
    pub fn registry(&self) -> Option<Arc<ModuleRegistry>> {
        self.shared.registry.upgrade()
    }

    /// Cancelled when the application begins shutting down.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }
}

/// Builds the application-level [`ModuleCtx`]. Unset parts get inert defaults.
pub struct ModuleContextBuilder {
    registry: Weak<ModuleRegistry>,
    config: Option<Arc<dyn ConfigProvider>>,
    storage: Option<Arc<dyn Storage>>,
    routes: Option<Arc<RouteTable>>,
    events: Option<Arc<EventBus>>,
    services: Option<Arc<ServiceRegistry>>,
    auth: Option<Arc<dyn AuthProvider>>,
    cancel: Option<CancellationToken>,
}

impl ModuleContextBuilder {
    pub fn new(registry: &Arc<ModuleRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            config: None,
            storage: None,
            routes: None,
            events: None,
            services: None,
            auth: None,
            cancel: None,
        }
    }

    pub fn config(mut self, config: Arc<dyn ConfigProvider>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn routes(mut self, routes: Arc<RouteTable>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> ModuleCtx {
        let shared = SharedInfra {
            config: self.config.unwrap_or_else(|| Arc::new(EmptyConfigProvider)),
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            routes: self.routes.unwrap_or_default(),
            events: self.events.unwrap_or_default(),
            services: self.services.unwrap_or_default(),
            auth: self.auth.unwrap_or_else(|| Arc::new(DisabledAuth)),
            registry: self.registry,
            cancel: self.cancel.unwrap_or_default(),
        };
        ModuleCtx {
            module: Arc::from(""),
            shared: Arc::new(shared),
        }
    }
}

/// Provider with no sections at all.
pub struct EmptyConfigProvider;

impl ConfigProvider for EmptyConfigProvider {
    fn get_module_config(&self, _module_name: &str) -> Option<&serde_json::Value> {
        None
    }

    fn get_config_raw(&self, _key: &str) -> Option<serde_json::Value> {
        None
    }
}
