//! Application - drives modules through the lifecycle phases and owns the
//! HTTP server and graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{body::Body, Router};
use http::{Request, Response};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{field::Empty, Span};

use appkit_bootstrap::{AppConfig, AppConfigProvider, ServerConfig};

use super::phase::{Phase, PhaseTracker};
use super::runner::{wait_for_trigger, ShutdownOptions};
use super::shutdown::{Deadline, ShutdownReport, StepOutcome};
use super::BootstrapError;
use crate::auth::{auth_from_config, AuthProvider};
use crate::context::{ModuleContextBuilder, ModuleCtx};
use crate::contracts::Module;
use crate::events::EventBus;
use crate::http::{system_routes, RouteTable};
use crate::registry::{ModuleRegistry, RegistryError};
use crate::services::ServiceRegistry;
use crate::storage::{SqlStorage, Storage};

/// Where the shared store comes from.
#[derive(Clone, Default)]
pub enum StorageOptions {
    /// Connect with the `database` config section (in-memory SQLite if absent).
    #[default]
    FromConfig,
    /// Use an already built backend.
    Provided(Arc<dyn Storage>),
}

/// Assembles registered modules into a running server.
///
/// ```rust,ignore
/// let mut app = Application::new(config);
/// app.register(Arc::new(UsersModule::default()))?;
/// app.register(Arc::new(AuditModule::default()))?;
/// app.run(ShutdownOptions::Signals).await?;
/// ```
pub struct Application {
    config: Arc<AppConfig>,
    registry: ModuleRegistry,
    storage: StorageOptions,
    auth: Option<Arc<dyn AuthProvider>>,
    phases: Arc<PhaseTracker>,
}

impl Application {
    pub fn new(config: AppConfig) -> Self {
        let mut registry = ModuleRegistry::new();
        registry.set_hook_timeout(config.runtime.hook_timeout);
        Self {
            config: Arc::new(config),
            registry,
            storage: StorageOptions::default(),
            auth: None,
            phases: Arc::new(PhaseTracker::new()),
        }
    }

    pub fn with_storage(mut self, storage: StorageOptions) -> Self {
        self.storage = storage;
        self
    }

    /// Overrides the adapter chosen from the `auth` config section.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        self.registry.register(module)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phases.current()
    }

    /// Shared handle to the lifecycle tracker. It outlives `start`, so callers
    /// can see which phase a failed startup reached.
    pub fn phase_tracker(&self) -> Arc<PhaseTracker> {
        self.phases.clone()
    }

    /// Full cycle: start, wait for the shutdown trigger, tear down.
    pub async fn run(self, shutdown: ShutdownOptions) -> Result<ShutdownReport, BootstrapError> {
        let running = self.start().await?;
        running.wait(shutdown).await;
        Ok(running.shutdown().await)
    }

    /// Runs every startup phase through `Serving` and returns a handle.
    ///
    /// On failure, modules that already started are stopped and the bus is
    /// stopped before the error is returned.
    pub async fn start(self) -> Result<RunningApplication, BootstrapError> {
        let Application {
            config,
            registry,
            storage,
            auth,
            phases,
        } = self;

        tracing::info!(modules = registry.len(), "Starting application");

        let storage: Arc<dyn Storage> = match storage {
            StorageOptions::Provided(storage) => storage,
            StorageOptions::FromConfig => {
                let db = config.resolved_database().map_err(|e| {
                    fail(Phase::Uninitialized, BootstrapError::Config(e))
                })?;
                let storage = SqlStorage::connect(&db)
                    .await
                    .map_err(|e| fail(Phase::Uninitialized, BootstrapError::Storage(e)))?;
                Arc::new(storage)
            }
        };

        let registry = Arc::new(registry);
        let bus = Arc::new(EventBus::new(config.event_bus.clone()));
        let routes = Arc::new(RouteTable::new());
        let auth = auth.unwrap_or_else(|| auth_from_config(&config.auth));
        let cancel = CancellationToken::new();
        let ctx = ModuleContextBuilder::new(&registry)
            .config(Arc::new(AppConfigProvider::from_arc(config.clone())))
            .storage(storage.clone())
            .routes(routes.clone())
            .events(bus.clone())
            .services(Arc::new(ServiceRegistry::new()))
            .auth(auth)
            .cancellation_token(cancel.clone())
            .build();

        let core = AppCore {
            config,
            registry,
            ctx,
            storage,
            bus,
            routes,
            phases,
            cancel,
        };

        match core.bring_up().await {
            Ok(server) => Ok(RunningApplication { core, server }),
            Err(e) => {
                let e = fail(core.phases.current(), e);
                core.abort().await;
                Err(e)
            }
        }
    }
}

fn fail(phase: Phase, err: BootstrapError) -> BootstrapError {
    tracing::error!(phase = %phase, error = %err, cause = ?std::error::Error::source(&err).map(|e| e.to_string()), "Startup failed");
    err
}

/// Everything built during CoreServicesReady.
struct AppCore {
    config: Arc<AppConfig>,
    registry: Arc<ModuleRegistry>,
    ctx: ModuleCtx,
    storage: Arc<dyn Storage>,
    bus: Arc<EventBus>,
    routes: Arc<RouteTable>,
    phases: Arc<PhaseTracker>,
    cancel: CancellationToken,
}

struct ServerHandle {
    router: Router,
    local_addr: SocketAddr,
    task: JoinHandle<std::io::Result<()>>,
    stop: CancellationToken,
    finished: CancellationToken,
}

impl AppCore {
    async fn bring_up(&self) -> Result<ServerHandle, BootstrapError> {
        self.phases.advance(Phase::CoreServicesReady)?;

        self.init_modules().await?;
        self.phases.advance(Phase::ModulesInitialized)?;

        self.sync_schema().await?;
        self.phases.advance(Phase::SchemaSynced)?;

        self.register_contracts().await;
        self.phases.advance(Phase::ContractsRegistered)?;

        self.seed().await?;
        self.phases.advance(Phase::Seeded)?;

        self.bus.start().map_err(BootstrapError::EventBus)?;
        self.phases.advance(Phase::EventBusStarted)?;

        let router = self.start_modules().await?;
        self.phases.advance(Phase::ModulesStarted)?;

        let server = self.serve(router).await?;
        self.phases.advance(Phase::Serving)?;
        Ok(server)
    }

    fn ordered(&self) -> Vec<Arc<dyn Module>> {
        self.registry.ordered().unwrap_or_default()
    }

    async fn init_modules(&self) -> Result<(), BootstrapError> {
        self.registry.initialize_all(&self.ctx).await?;

        for module in self.ordered() {
            for handler in module.event_handlers() {
                let handler_name = handler.name().to_string();
                let count = self.bus.subscribe_all(handler).map_err(|source| {
                    BootstrapError::Subscribe {
                        module: module.name().to_string(),
                        source,
                    }
                })?;
                tracing::debug!(module = module.name(), handler = %handler_name, event_types = count, "Event handler subscribed");
            }
        }
        Ok(())
    }

    async fn sync_schema(&self) -> Result<(), BootstrapError> {
        let mut owners: HashMap<String, String> = HashMap::new();
        let mut entities = Vec::new();
        for module in self.ordered() {
            for entity in module.entities() {
                if let Some(first) = owners.get(entity.table()) {
                    return Err(BootstrapError::DuplicateEntity {
                        table: entity.table().to_string(),
                        first: first.clone(),
                        second: module.name().to_string(),
                    });
                }
                owners.insert(entity.table().to_string(), module.name().to_string());
                entities.push(entity);
            }
        }

        let report = self
            .storage
            .sync_schema(&entities)
            .await
            .map_err(BootstrapError::SchemaSync)?;
        tracing::info!(
            backend = self.storage.backend(),
            tables = ?report.tables,
            statements = report.statements,
            "Schema synced"
        );
        Ok(())
    }

    /// Best-effort: failures are logged and skipped.
    async fn register_contracts(&self) {
        for module in self.ordered() {
            let Some(registrar) = module.as_contract_registrar() else {
                continue;
            };
            let ctx = self.ctx.for_module(module.name());
            match registrar.register_contracts(&ctx).await {
                Ok(count) => {
                    tracing::info!(module = module.name(), contracts = count, "Contracts registered")
                }
                Err(e) => tracing::warn!(
                    module = module.name(),
                    error = %format!("{e:#}"),
                    "Contract registration failed, continuing"
                ),
            }
        }
    }

    async fn seed(&self) -> Result<(), BootstrapError> {
        for module in self.ordered() {
            let Some(seeder) = module.as_seeder() else {
                continue;
            };
            let ctx = self.ctx.for_module(module.name());
            seeder
                .seed(&ctx)
                .await
                .map_err(|source| BootstrapError::Seed {
                    module: module.name().to_string(),
                    source,
                })?;
            tracing::info!(module = module.name(), "Module seeded");
        }
        Ok(())
    }

    async fn start_modules(&self) -> Result<Router, BootstrapError> {
        self.registry.start_all(&self.cancel).await?;

        self.routes
            .merge("system", system_routes(self.registry.clone()))?;
        for module in self.ordered() {
            let ctx = self.ctx.for_module(module.name());
            for provider in module.routes() {
                self.routes.mount(module.name(), provider.as_ref(), &ctx)?;
            }
        }

        let router = self.routes.freeze()?;
        Ok(http_layers(router, &self.config.server))
    }

    async fn serve(&self, router: Router) -> Result<ServerHandle, BootstrapError> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| BootstrapError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BootstrapError::Bind { addr, source })?;
        tracing::info!("HTTP server bound on {}", local_addr);

        let stop = CancellationToken::new();
        let finished = CancellationToken::new();
        let shutdown = {
            let stop = stop.clone();
            async move {
                stop.cancelled().await;
                tracing::info!("HTTP server shutting down gracefully");
            }
        };
        let done = finished.clone();
        let app = router.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await;
            done.cancel();
            result
        });

        Ok(ServerHandle {
            router,
            local_addr,
            task,
            stop,
            finished,
        })
    }

    /// Undo a partial startup.
    ///
    /// The phase tracker is left at the last completed phase: `Stopping` and
    /// `Stopped` only follow `Serving`, so the history shows where startup
    /// broke off. The teardown itself is logged.
    async fn abort(&self) {
        let at = self.phases.current();
        tracing::warn!(phase = %at, "Tearing down after failed startup");
        self.cancel.cancel();
        let report = self
            .registry
            .stop_all_within(&self.cancel, Some(self.config.shutdown.modules_timeout))
            .await;
        if !report.stopped.is_empty() {
            tracing::warn!(stopped = ?report.stopped, "Stopped modules after failed startup");
        }
        self.bus.stop(self.config.bus_stop_timeout()).await;
        self.storage.close().await;
        tracing::info!(phase = %at, "Teardown after failed startup complete");
    }
}

fn http_layers(router: Router, server: &ServerConfig) -> Router {
    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request<Body>| {
                tracing::info_span!(
                    "http_request",
                    method = %req.method(),
                    uri = %req.uri().path(),
                    status = Empty,
                    latency_ms = Empty,
                )
            })
            .on_response(|res: &Response<Body>, latency: Duration, span: &Span| {
                span.record("status", res.status().as_u16());
                span.record("latency_ms", latency.as_millis() as u64);
            }),
    );

    if server.timeout_sec == 0 {
        return router;
    }
    #[allow(deprecated)]
    let timeout = TimeoutLayer::new(Duration::from_secs(server.timeout_sec));
    router.layer(timeout)
}

/// A started application: serving HTTP until [`shutdown`](Self::shutdown).
pub struct RunningApplication {
    core: AppCore,
    server: ServerHandle,
}

impl RunningApplication {
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr
    }

    /// The served router, for in-process requests.
    pub fn router(&self) -> Router {
        self.server.router.clone()
    }

    pub fn context(&self) -> &ModuleCtx {
        &self.core.ctx
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.core.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.core.bus
    }

    pub fn phase(&self) -> Phase {
        self.core.phases.current()
    }

    pub fn phase_history(&self) -> Vec<Phase> {
        self.core.phases.history()
    }

    /// Resolves when the trigger fires or the HTTP server exits on its own.
    pub async fn wait(&self, shutdown: ShutdownOptions) {
        tokio::select! {
            _ = wait_for_trigger(shutdown) => {}
            _ = self.server.finished.cancelled() => {
                tracing::warn!("HTTP server exited, shutting down");
            }
        }
    }

    /// HTTP drain, module stop (reverse order), bus stop, storage close.
    /// Every step is bounded; a slow or failing step never blocks the rest.
    pub async fn shutdown(self) -> ShutdownReport {
        let RunningApplication { core, server } = self;
        let started = Instant::now();
        if let Err(e) = core.phases.advance(Phase::Stopping) {
            tracing::warn!(error = %e, "Unexpected phase at shutdown");
        }

        let budget = &core.config.shutdown;
        let deadline = Deadline::after(budget.overall_timeout);

        // 1) stop accepting, let in-flight requests finish
        server.stop.cancel();
        let mut task = server.task;
        let limit = deadline.clamp(budget.http_grace);
        let http = match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(()))) => StepOutcome::Completed,
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "HTTP server failed");
                StepOutcome::Failed(e.to_string())
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "HTTP server task failed");
                StepOutcome::Failed(e.to_string())
            }
            Err(_) => {
                task.abort();
                tracing::warn!(timeout = ?limit, "HTTP drain timed out, dropping connections");
                StepOutcome::TimedOut(limit)
            }
        };

        // 2) modules, reverse dependency order; each hook gets a share of the limit
        core.cancel.cancel();
        let limit = deadline.clamp(budget.modules_timeout);
        let module_report = core
            .registry
            .stop_all_within(&core.cancel, Some(limit))
            .await;
        let modules = if module_report.timed_out() {
            tracing::warn!(timeout = ?limit, "Module stop timed out");
            StepOutcome::TimedOut(limit)
        } else if !module_report.is_clean() {
            StepOutcome::Failed(format!(
                "{} module(s) failed to stop",
                module_report.errors.len()
            ))
        } else {
            StepOutcome::Completed
        };

        // 3) event bus
        let event_bus = core
            .bus
            .stop(deadline.clamp(core.config.bus_stop_timeout()))
            .await;

        // 4) storage
        if tokio::time::timeout(deadline.remaining(), core.storage.close())
            .await
            .is_err()
        {
            tracing::warn!("Storage close timed out");
        }

        if let Err(e) = core.phases.advance(Phase::Stopped) {
            tracing::warn!(error = %e, "Unexpected phase at shutdown");
        }

        let report = ShutdownReport {
            http,
            modules,
            module_report,
            event_bus,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            clean = report.is_clean(),
            "Shutdown complete"
        );
        report
    }
}
