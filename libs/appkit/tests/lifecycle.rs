use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, routing::get, Router};
use http::{Request, StatusCode};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use appkit::events::BusStopOutcome;
use appkit::runtime::StepOutcome;
use appkit::{
    async_trait, AppConfig, Application, BootstrapError, ContractRegistrar, EntityDescriptor,
    FnServiceProvider, MemoryStorage, Module, ModuleCtx, Phase, RegistryError, RouteProvider,
    Seeder, ServiceHandle, ShutdownOptions, SqlTable, StorageOptions,
};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct Behaviour {
    fail_start: bool,
    fail_seed: bool,
    fail_contracts: bool,
    hang_stop: bool,
    provides: Option<&'static str>,
    requires: Option<&'static str>,
    table: Option<&'static str>,
    route: Option<&'static str>,
}

struct Probe {
    name: &'static str,
    deps: Vec<&'static str>,
    log: Log,
    behaviour: Behaviour,
}

impl Probe {
    fn new(name: &'static str, deps: &[&'static str], log: &Log) -> Self {
        Self {
            name,
            deps: deps.to_vec(),
            log: log.clone(),
            behaviour: Behaviour::default(),
        }
    }

    fn with(mut self, f: impl FnOnce(&mut Behaviour)) -> Self {
        f(&mut self.behaviour);
        self
    }

    fn record(&self, what: &str) {
        self.log.lock().push(format!("{what}:{}", self.name));
    }
}

struct Ping {
    prefix: &'static str,
    body: &'static str,
}

impl RouteProvider for Ping {
    fn prefix(&self) -> &str {
        self.prefix
    }

    fn register_routes(&self, router: Router, _ctx: &ModuleCtx) -> anyhow::Result<Router> {
        let body = self.body;
        Ok(router.route("/ping", get(move || async move { body })))
    }
}

/// Holds every request open far longer than any test grace period.
struct Stall;

impl RouteProvider for Stall {
    fn prefix(&self) -> &str {
        "/stall"
    }

    fn register_routes(&self, router: Router, _ctx: &ModuleCtx) -> anyhow::Result<Router> {
        Ok(router.route(
            "/wait",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        ))
    }
}

#[async_trait]
impl Module for Probe {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn dependencies(&self) -> Vec<&str> {
        self.deps.clone()
    }

    async fn initialize(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        if let Some(service) = self.behaviour.requires {
            let value = ctx.services().get::<String>(service)?;
            self.log.lock().push(format!("saw:{value}"));
        }
        self.record("init");
        Ok(())
    }

    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        if self.behaviour.fail_start {
            anyhow::bail!("refusing to start");
        }
        self.record("start");
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        if self.behaviour.hang_stop {
            std::future::pending::<()>().await;
        }
        self.record("stop");
        Ok(())
    }

    fn entities(&self) -> Vec<EntityDescriptor> {
        self.behaviour
            .table
            .map(|t| EntityDescriptor::new(t, SqlTable::new().column("id", "TEXT PRIMARY KEY")))
            .into_iter()
            .collect()
    }

    fn routes(&self) -> Vec<Arc<dyn RouteProvider>> {
        self.behaviour
            .route
            .map(|prefix| {
                Arc::new(Ping {
                    prefix,
                    body: self.name,
                }) as Arc<dyn RouteProvider>
            })
            .into_iter()
            .collect()
    }

    fn services(&self) -> Vec<Arc<dyn appkit::ServiceProvider>> {
        let Some(service) = self.behaviour.provides else {
            return Vec::new();
        };
        let owner = self.name;
        vec![Arc::new(FnServiceProvider::new(service, move |_ctx| {
            Ok(ServiceHandle::new(Arc::new(format!("hello from {owner}"))))
        }))]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_seeder(&self) -> Option<&dyn Seeder> {
        Some(self)
    }

    fn as_contract_registrar(&self) -> Option<&dyn ContractRegistrar> {
        Some(self)
    }
}

#[async_trait]
impl Seeder for Probe {
    async fn seed(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        if self.behaviour.fail_seed {
            anyhow::bail!("seed data rejected");
        }
        self.record("seed");
        Ok(())
    }
}

#[async_trait]
impl ContractRegistrar for Probe {
    async fn register_contracts(&self, _ctx: &ModuleCtx) -> anyhow::Result<usize> {
        if self.behaviour.fail_contracts {
            anyhow::bail!("contract store unavailable");
        }
        self.record("contracts");
        Ok(1)
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.auth.disabled = true;
    config.shutdown.overall_timeout = Duration::from_secs(5);
    config
}

fn app(modules: Vec<Probe>) -> Application {
    app_with(test_config(), modules)
}

fn app_with(config: AppConfig, modules: Vec<Probe>) -> Application {
    let mut app = Application::new(config)
        .with_storage(StorageOptions::Provided(Arc::new(MemoryStorage::new())));
    for module in modules {
        app.register(Arc::new(module)).unwrap();
    }
    app
}

fn entries(log: &Log, prefix: &str) -> Vec<String> {
    log.lock()
        .iter()
        .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
        .collect()
}

async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
    let res = router
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = res.status();
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn modules_run_in_dependency_order_and_stop_in_reverse() {
    let log = Log::default();
    let app = app(vec![
        Probe::new("billing", &["reports"], &log),
        Probe::new("reports", &["base"], &log),
        Probe::new("base", &[], &log),
    ]);

    let running = app.start().await.unwrap();
    assert_eq!(running.phase(), Phase::Serving);
    assert_eq!(entries(&log, "init:"), ["base", "reports", "billing"]);
    assert_eq!(entries(&log, "seed:"), ["base", "reports", "billing"]);
    assert_eq!(entries(&log, "start:"), ["base", "reports", "billing"]);

    let history = running.phase_history();
    let report = running.shutdown().await;
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(entries(&log, "stop:"), ["billing", "reports", "base"]);
    assert_eq!(
        history,
        [
            Phase::Uninitialized,
            Phase::CoreServicesReady,
            Phase::ModulesInitialized,
            Phase::SchemaSynced,
            Phase::ContractsRegistered,
            Phase::Seeded,
            Phase::EventBusStarted,
            Phase::ModulesStarted,
            Phase::Serving,
        ]
    );
}

#[tokio::test]
async fn missing_dependency_fails_before_any_hook() {
    let log = Log::default();
    let err = app(vec![Probe::new("a", &["b"], &log)])
        .start()
        .await
        .err()
        .unwrap();

    match err {
        BootstrapError::Registry(RegistryError::UnresolvedDependency { module, depends_on }) => {
            assert_eq!(module, "a");
            assert_eq!(depends_on, "b");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn cycle_is_reported_with_its_path() {
    let log = Log::default();
    let err = app(vec![
        Probe::new("a", &["b"], &log),
        Probe::new("b", &["a"], &log),
    ])
    .start()
    .await
    .err()
    .unwrap();

    assert!(matches!(
        err,
        BootstrapError::Registry(RegistryError::CyclicDependency { .. })
    ));
    assert!(err.to_string().contains("a -> b -> a"), "{err}");
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn services_are_visible_to_dependents_during_init() {
    let log = Log::default();
    let app = app(vec![
        Probe::new("consumer", &["provider"], &log).with(|b| b.requires = Some("greeter")),
        Probe::new("provider", &[], &log).with(|b| b.provides = Some("greeter")),
    ]);

    let running = app.start().await.unwrap();
    assert!(log.lock().contains(&"saw:hello from provider".to_string()));
    assert_eq!(
        running.context().services().owner_of("greeter").as_deref(),
        Some("provider")
    );
    running.shutdown().await;
}

#[tokio::test]
async fn module_routes_are_mounted_under_their_prefix() {
    let log = Log::default();
    let app = app(vec![
        Probe::new("h1", &[], &log).with(|b| b.route = Some("/h1")),
        Probe::new("h2", &[], &log).with(|b| b.route = Some("/h2")),
    ]);
    let running = app.start().await.unwrap();

    assert_eq!(get_body(running.router(), "/h1/ping").await, (StatusCode::OK, "h1".into()));
    assert_eq!(get_body(running.router(), "/h2/ping").await, (StatusCode::OK, "h2".into()));
    assert_eq!(get_body(running.router(), "/h3/ping").await.0, StatusCode::NOT_FOUND);

    let (status, body) = get_body(running.router(), "/system/modules").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["order"], serde_json::json!(["h1", "h2"]));

    running.shutdown().await;
}

#[tokio::test]
async fn serves_over_tcp_until_shutdown() {
    let running = app(Vec::new()).start().await.unwrap();
    let addr = running.local_addr();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("ok"));

    let report = running.shutdown().await;
    assert_eq!(report.http, StepOutcome::Completed);
    assert_eq!(report.event_bus, BusStopOutcome::Drained);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn duplicate_route_prefix_is_fatal() {
    let log = Log::default();
    let err = app(vec![
        Probe::new("first", &[], &log).with(|b| b.route = Some("/shared")),
        Probe::new("second", &[], &log).with(|b| b.route = Some("/shared")),
    ])
    .start()
    .await
    .err()
    .unwrap();

    assert!(matches!(err, BootstrapError::Routes(_)), "{err:?}");
    assert_eq!(err.module(), Some("second"));
    // both had started; the failed boot stops them again
    assert_eq!(entries(&log, "stop:"), ["second", "first"]);
}

#[tokio::test]
async fn seed_failure_is_fatal_and_nothing_starts() {
    let log = Log::default();
    let app = app(vec![
        Probe::new("base", &[], &log),
        Probe::new("broken", &["base"], &log).with(|b| b.fail_seed = true),
    ]);
    let phases = app.phase_tracker();
    let err = app.start().await.err().unwrap();

    // history ends at the last completed phase
    assert_eq!(phases.current(), Phase::ContractsRegistered);
    assert!(!phases.history().contains(&Phase::Stopping));

    match &err {
        BootstrapError::Seed { module, .. } => assert_eq!(module, "broken"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(entries(&log, "seed:"), ["base"]);
    assert!(entries(&log, "start:").is_empty());
    assert!(entries(&log, "stop:").is_empty());
}

#[tokio::test]
async fn contract_failure_does_not_stop_startup() {
    let log = Log::default();
    let app = app(vec![
        Probe::new("flaky", &[], &log).with(|b| b.fail_contracts = true),
        Probe::new("fine", &["flaky"], &log),
    ]);

    let running = app.start().await.unwrap();
    assert_eq!(running.phase(), Phase::Serving);
    assert_eq!(entries(&log, "contracts:"), ["fine"]);
    running.shutdown().await;
}

#[tokio::test]
async fn start_failure_stops_already_started_modules() {
    let log = Log::default();
    let err = app(vec![
        Probe::new("base", &[], &log),
        Probe::new("late", &["base"], &log).with(|b| b.fail_start = true),
    ])
    .start()
    .await
    .err()
    .unwrap();

    assert!(matches!(
        err,
        BootstrapError::Registry(RegistryError::Start { ref module, .. }) if module == "late"
    ));
    assert_eq!(entries(&log, "start:"), ["base"]);
    assert_eq!(entries(&log, "stop:"), ["base"]);
}

#[tokio::test]
async fn two_modules_cannot_own_the_same_table() {
    let log = Log::default();
    let err = app(vec![
        Probe::new("one", &[], &log).with(|b| b.table = Some("items")),
        Probe::new("two", &["one"], &log).with(|b| b.table = Some("items")),
    ])
    .start()
    .await
    .err()
    .unwrap();

    match err {
        BootstrapError::DuplicateEntity {
            table,
            first,
            second,
        } => {
            assert_eq!(table, "items");
            assert_eq!(first, "one");
            assert_eq!(second, "two");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn run_returns_when_the_token_fires() {
    let log = Log::default();
    let app = app(vec![Probe::new("solo", &[], &log)]);
    let token = CancellationToken::new();

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = app.run(ShutdownOptions::Token(token)).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(entries(&log, "stop:"), ["solo"]);
}

#[tokio::test]
async fn unsupported_database_fails_during_core_services() {
    let mut config = test_config();
    config.database = Some(appkit_bootstrap::DatabaseConfig {
        dsn: "nosuchdb://localhost/none".to_string(),
        ..Default::default()
    });
    let err = Application::new(config).start().await.err().unwrap();
    assert!(matches!(err, BootstrapError::Storage(_)), "{err:?}");
}

#[tokio::test]
async fn shutdown_step_timeout_does_not_block_the_rest() {
    let log = Log::default();
    let mut config = test_config();
    config.shutdown.modules_timeout = Duration::from_millis(200);
    let app = app_with(
        config,
        vec![
            Probe::new("base", &[], &log),
            Probe::new("reports", &["base"], &log).with(|b| b.hang_stop = true),
        ],
    );
    let phases = app.phase_tracker();
    let running = app.start().await.unwrap();
    let report = running.shutdown().await;

    assert_eq!(report.http, StepOutcome::Completed);
    assert!(matches!(report.modules, StepOutcome::TimedOut(_)), "{report:?}");
    assert_eq!(report.module_report.stopped, ["reports", "base"]);
    assert_eq!(report.module_report.errors.len(), 1);
    assert_eq!(report.module_report.errors[0].module, "reports");
    assert!(report.module_report.errors[0].timed_out());
    // the dependency is still stopped and later steps still run
    assert_eq!(entries(&log, "stop:"), ["base"]);
    assert_eq!(report.event_bus, BusStopOutcome::Drained);
    assert_eq!(phases.current(), Phase::Stopped);
    assert!(!report.is_clean());
    assert!(report.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn http_drain_timeout_moves_on_to_modules() {
    struct Staller;

    #[async_trait]
    impl Module for Staller {
        fn name(&self) -> &str {
            "staller"
        }
        fn version(&self) -> &str {
            "0.1.0"
        }
        fn routes(&self) -> Vec<Arc<dyn RouteProvider>> {
            vec![Arc::new(Stall)]
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    let log = Log::default();
    let mut config = test_config();
    config.shutdown.http_grace = Duration::from_millis(100);
    let mut app = app_with(config, vec![Probe::new("base", &[], &log)]);
    app.register(Arc::new(Staller)).unwrap();
    let running = app.start().await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(running.local_addr())
        .await
        .unwrap();
    stream
        .write_all(b"GET /stall/wait HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    // let the request reach the handler
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = running.shutdown().await;
    assert_eq!(report.http, StepOutcome::TimedOut(Duration::from_millis(100)));
    assert_eq!(report.modules, StepOutcome::Completed);
    assert_eq!(entries(&log, "stop:"), ["base"]);
    assert_eq!(report.event_bus, BusStopOutcome::Drained);
    assert!(report.elapsed < Duration::from_secs(5));
}
