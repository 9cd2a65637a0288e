use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::ModuleCtx;
use crate::contracts::Module;

/// Lifecycle position of a single module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Registered,
    Initialized,
    Started,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleMetadata {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub registration_index: usize,
}

struct ModuleEntry {
    meta: ModuleMetadata,
    module: Arc<dyn Module>,
    state: Mutex<ModuleState>,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("name", &self.meta.name)
            .field("deps", &self.meta.dependencies)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// A lifecycle hook that did not finish within its limit.
#[derive(Debug, Error)]
#[error("{hook} hook of module '{module}' timed out after {limit:?}")]
pub struct HookTimeout {
    pub module: String,
    pub hook: &'static str,
    pub limit: Duration,
}

/// A module whose `stop` hook failed or timed out.
#[derive(Debug)]
pub struct ModuleStopError {
    pub module: String,
    pub error: anyhow::Error,
}

impl ModuleStopError {
    pub fn timed_out(&self) -> bool {
        self.error.is::<HookTimeout>()
    }
}

#[derive(Debug, Default)]
pub struct StopReport {
    /// Modules whose stop hook ran, in the order it ran.
    pub stopped: Vec<String>,
    /// Modules that were never started or were already stopped.
    pub skipped: Vec<String>,
    pub errors: Vec<ModuleStopError>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn timed_out(&self) -> bool {
        self.errors.iter().any(ModuleStopError::timed_out)
    }
}

/// Registration-ordered module set with a frozen dependency order.
///
/// Registration takes `&mut self`; once the registry is shared (`Arc`) the
/// module set is fixed and only lifecycle state moves.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: Vec<ModuleEntry>,
    order: OnceLock<Vec<usize>>,
    hook_timeout: Option<Duration>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.entries.iter().map(|e| e.meta.name.as_str()).collect();
        f.debug_struct("ModuleRegistry")
            .field("modules", &names)
            .field("order_resolved", &self.order.get().is_some())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound for every initialize/start/stop hook.
    pub fn set_hook_timeout(&mut self, timeout: Option<Duration>) {
        self.hook_timeout = timeout;
    }

    /// Adds a module. A duplicate name is rejected and leaves the registry unchanged.
    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        let name = module.name().to_string();
        if self.index_of(&name).is_some() {
            return Err(RegistryError::DuplicateModule { module: name });
        }

        let mut dependencies: Vec<String> = Vec::new();
        for dep in module.dependencies() {
            if !dependencies.iter().any(|d| d == dep) {
                dependencies.push(dep.to_string());
            }
        }

        let meta = ModuleMetadata {
            version: module.version().to_string(),
            registration_index: self.entries.len(),
            name,
            dependencies,
        };
        tracing::debug!(
            module = %meta.name,
            version = %meta.version,
            deps = ?meta.dependencies,
            "Module registered"
        );
        self.entries.push(ModuleEntry {
            meta,
            module,
            state: Mutex::new(ModuleState::Registered),
        });
        Ok(())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.meta.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.index_of(name).map(|i| self.entries[i].module.clone())
    }

    /// Concrete-type access to a registered module.
    pub fn get_as<M: Module>(&self, name: &str) -> Option<&M> {
        let i = self.index_of(name)?;
        self.entries[i].module.as_any().downcast_ref::<M>()
    }

    /// Modules in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Module>> {
        self.entries.iter().map(|e| e.module.clone()).collect()
    }

    /// Modules in resolved dependency order; `None` before the order is frozen.
    pub fn ordered(&self) -> Option<Vec<Arc<dyn Module>>> {
        let order = self.order.get()?;
        Some(order.iter().map(|&i| self.entries[i].module.clone()).collect())
    }

    /// Names in resolved dependency order; `None` before the order is frozen.
    pub fn order(&self) -> Option<Vec<String>> {
        let order = self.order.get()?;
        Some(
            order
                .iter()
                .map(|&i| self.entries[i].meta.name.clone())
                .collect(),
        )
    }

    pub fn metadata(&self) -> Vec<ModuleMetadata> {
        self.entries.iter().map(|e| e.meta.clone()).collect()
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.index_of(name).map(|i| *self.entries[i].state.lock())
    }

    /// Computes a deterministic topological order without freezing it.
    ///
    /// Among modules whose dependencies are satisfied, the earliest registered
    /// goes first, so independent modules keep their registration order.
    pub fn resolve_order(&self) -> Result<Vec<String>, RegistryError> {
        let order = self.compute_order()?;
        Ok(order
            .into_iter()
            .map(|i| self.entries[i].meta.name.clone())
            .collect())
    }

    fn compute_order(&self) -> Result<Vec<usize>, RegistryError> {
        let n = self.entries.len();

        // deps[i]: indices module i depends on
        let mut deps = vec![Vec::<usize>::new(); n];
        for (i, entry) in self.entries.iter().enumerate() {
            for dep in &entry.meta.dependencies {
                let d = self
                    .index_of(dep)
                    .ok_or_else(|| RegistryError::UnresolvedDependency {
                        module: entry.meta.name.clone(),
                        depends_on: dep.clone(),
                    })?;
                deps[i].push(d);
            }
        }

        if let Some(path) = self.detect_cycle_with_path(&deps) {
            return Err(RegistryError::CyclicDependency { path });
        }

        // Kahn over dependents, ready set keyed by registration index.
        let mut dependents = vec![Vec::<usize>::new(); n];
        let mut indeg = vec![0usize; n];
        for (i, ds) in deps.iter().enumerate() {
            indeg[i] = ds.len();
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indeg[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(u) = ready.pop_first() {
            order.push(u);
            for &w in &dependents[u] {
                indeg[w] -= 1;
                if indeg[w] == 0 {
                    ready.insert(w);
                }
            }
        }

        if order.len() != n {
            let path = (0..n)
                .filter(|i| !order.contains(i))
                .map(|i| self.entries[i].meta.name.clone())
                .collect();
            return Err(RegistryError::CyclicDependency { path });
        }
        Ok(order)
    }

    /// DFS over "depends on" edges; the returned path reads `a -> b -> a`
    /// meaning a depends on b which depends on a.
    fn detect_cycle_with_path(&self, deps: &[Vec<usize>]) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn dfs(
            node: usize,
            deps: &[Vec<usize>],
            colors: &mut [Color],
            path: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            colors[node] = Color::Gray;
            path.push(node);
            for &next in &deps[node] {
                match colors[next] {
                    Color::Gray => {
                        if let Some(start) = path.iter().position(|&n| n == next) {
                            let mut cycle = path[start..].to_vec();
                            cycle.push(next);
                            return Some(cycle);
                        }
                    }
                    Color::White => {
                        if let Some(cycle) = dfs(next, deps, colors, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
            path.pop();
            colors[node] = Color::Black;
            None
        }

        let mut colors = vec![Color::White; deps.len()];
        let mut path = Vec::new();
        for i in 0..deps.len() {
            if colors[i] == Color::White {
                if let Some(cycle) = dfs(i, deps, &mut colors, &mut path) {
                    return Some(
                        cycle
                            .into_iter()
                            .map(|i| self.entries[i].meta.name.clone())
                            .collect(),
                    );
                }
            }
        }
        None
    }

    fn frozen_order(&self) -> Result<&[usize], RegistryError> {
        self.order
            .get()
            .map(Vec::as_slice)
            .ok_or(RegistryError::OrderNotResolved)
    }

    async fn run_hook<F>(&self, module: &str, hook: &'static str, fut: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        self.run_hook_within(module, hook, fut, None).await
    }

    /// Like `run_hook`, additionally bounded by `limit`.
    async fn run_hook_within<F>(
        &self,
        module: &str,
        hook: &'static str,
        fut: F,
        limit: Option<Duration>,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let limit = match (self.hook_timeout, limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match limit {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(res) => res,
                Err(_) => Err(HookTimeout {
                    module: module.to_string(),
                    hook,
                    limit,
                }
                .into()),
            },
            None => fut.await,
        }
    }

    /// Resolves and freezes the order, then initializes every module in it.
    ///
    /// After a module's `initialize` succeeds its declared services are
    /// published, so later modules can look them up. Stops at the first failure.
    pub async fn initialize_all(&self, ctx: &ModuleCtx) -> Result<(), RegistryError> {
        if self.order.get().is_some() {
            return Err(RegistryError::AlreadyInitialized);
        }
        let order = self.compute_order()?;
        let order = self.order.get_or_init(|| order);

        tracing::info!(
            modules = ?order.iter().map(|&i| self.entries[i].meta.name.as_str()).collect::<Vec<_>>(),
            "Module dependency order resolved (topo)"
        );

        let mut initialized = 0usize;
        for &i in order {
            let entry = &self.entries[i];
            let name = entry.meta.name.as_str();
            let mctx = ctx.for_module(name);

            tracing::debug!(module = name, "Initializing module");
            let result = self
                .run_hook(name, "initialize", entry.module.initialize(&mctx))
                .await
                .and_then(|()| self.publish_services(entry, &mctx));

            if let Err(source) = result {
                *entry.state.lock() = ModuleState::Failed;
                tracing::error!(module = name, error = %source, "Module initialization failed");
                return Err(RegistryError::Initialize {
                    module: name.to_string(),
                    initialized_before: initialized,
                    source,
                });
            }
            *entry.state.lock() = ModuleState::Initialized;
            initialized += 1;
            tracing::info!(module = name, version = %entry.meta.version, "Module initialized");
        }
        Ok(())
    }

    fn publish_services(&self, entry: &ModuleEntry, ctx: &ModuleCtx) -> anyhow::Result<()> {
        for provider in entry.module.services() {
            let handle = provider.create(ctx)?;
            ctx.services()
                .register_owned(provider.name(), &entry.meta.name, handle)?;
        }
        Ok(())
    }

    /// Starts initialized modules in dependency order. Stops at the first failure.
    pub async fn start_all(&self, cancel: &CancellationToken) -> Result<(), RegistryError> {
        let order = self.frozen_order()?;
        for &i in order {
            let entry = &self.entries[i];
            let name = entry.meta.name.as_str();
            match *entry.state.lock() {
                ModuleState::Initialized => {}
                ModuleState::Started => {
                    tracing::debug!(module = name, "Module already started");
                    continue;
                }
                _ => {
                    return Err(RegistryError::NotInitialized {
                        module: name.to_string(),
                    })
                }
            }

            tracing::debug!(module = name, "Starting module");
            if let Err(source) = self
                .run_hook(name, "start", entry.module.start(cancel.clone()))
                .await
            {
                *entry.state.lock() = ModuleState::Failed;
                tracing::error!(module = name, error = %source, "Module start failed");
                return Err(RegistryError::Start {
                    module: name.to_string(),
                    source,
                });
            }
            *entry.state.lock() = ModuleState::Started;
            tracing::info!(module = name, "Module started");
        }
        Ok(())
    }

    /// Stops started modules in reverse dependency order.
    ///
    /// Best-effort: a failing module is recorded and the rest still stop.
    /// A module's stop hook runs at most once across calls.
    pub async fn stop_all(&self, cancel: &CancellationToken) -> StopReport {
        self.stop_all_within(cancel, None).await
    }

    /// [`stop_all`](Self::stop_all) under an overall `budget`.
    ///
    /// Each stop hook gets an even share of what is left of the budget, so a
    /// hung hook times out on its own and the remaining modules still stop.
    pub async fn stop_all_within(
        &self,
        cancel: &CancellationToken,
        budget: Option<Duration>,
    ) -> StopReport {
        let mut report = StopReport::default();
        let Some(order) = self.order.get() else {
            return report;
        };
        let deadline = budget.map(|b| Instant::now() + b);

        let mut left = order
            .iter()
            .filter(|&&i| *self.entries[i].state.lock() == ModuleState::Started)
            .count() as u32;

        for &i in order.iter().rev() {
            let entry = &self.entries[i];
            let name = entry.meta.name.clone();
            {
                let mut state = entry.state.lock();
                if *state != ModuleState::Started {
                    tracing::debug!(module = %name, state = ?*state, "Skipping stop");
                    report.skipped.push(name);
                    continue;
                }
                // claim the stop before running the hook
                *state = ModuleState::Stopped;
            }

            let share = deadline.map(|at| {
                at.saturating_duration_since(Instant::now()) / left.max(1)
            });
            left = left.saturating_sub(1);

            tracing::debug!(module = %name, limit = ?share, "Stopping module");
            match self
                .run_hook_within(&name, "stop", entry.module.stop(cancel.clone()), share)
                .await
            {
                Ok(()) => tracing::info!(module = %name, "Module stopped"),
                Err(error) => {
                    tracing::warn!(module = %name, error = %error, "Failed to stop module");
                    report.errors.push(ModuleStopError {
                        module: name.clone(),
                        error,
                    });
                }
            }
            report.stopped.push(name);
        }
        report
    }
}

/// Structured errors for the module registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{module}' is already registered")]
    DuplicateModule { module: String },
    #[error("module '{module}' depends on unknown '{depends_on}'")]
    UnresolvedDependency { module: String, depends_on: String },
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("initialization failed for module '{module}' ({initialized_before} initialized before it)")]
    Initialize {
        module: String,
        initialized_before: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("start failed for '{module}'")]
    Start {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("module '{module}' has not been initialized")]
    NotInitialized { module: String },
    #[error("registry is already initialized")]
    AlreadyInitialized,
    #[error("dependency order has not been resolved yet")]
    OrderNotResolved,
}

impl RegistryError {
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::DuplicateModule { module }
            | Self::UnresolvedDependency { module, .. }
            | Self::Initialize { module, .. }
            | Self::Start { module, .. }
            | Self::NotInitialized { module } => Some(module),
            Self::CyclicDependency { path } => path.first().map(String::as_str),
            Self::AlreadyInitialized | Self::OrderNotResolved => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModuleContextBuilder;
    use crate::contracts::FnServiceProvider;
    use crate::services::ServiceHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: &'static str,
        deps: Vec<&'static str>,
        log: Log,
        fail_init: bool,
        fail_stop: bool,
        hang_stop: bool,
        stop_calls: AtomicUsize,
    }

    impl Probe {
        fn new(name: &'static str, deps: &[&'static str], log: &Log) -> Self {
            Self {
                name,
                deps: deps.to_vec(),
                log: log.clone(),
                fail_init: false,
                fail_stop: false,
                hang_stop: false,
                stop_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Module for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn dependencies(&self) -> Vec<&str> {
            self.deps.clone()
        }
        async fn initialize(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            self.log.lock().push(format!("init:{}", self.name));
            if self.fail_init {
                anyhow::bail!("boom");
            }
            Ok(())
        }
        async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            self.log.lock().push(format!("start:{}", self.name));
            Ok(())
        }
        async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_stop {
                std::future::pending::<()>().await;
            }
            self.log.lock().push(format!("stop:{}", self.name));
            if self.fail_stop {
                anyhow::bail!("stop failed");
            }
            Ok(())
        }
        fn services(&self) -> Vec<Arc<dyn crate::contracts::ServiceProvider>> {
            let name = format!("{}.svc", self.name);
            vec![Arc::new(FnServiceProvider::new(name, |_| {
                Ok(ServiceHandle::new(Arc::new(42u32)))
            }))]
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn build(modules: Vec<Probe>) -> Arc<ModuleRegistry> {
        let mut reg = ModuleRegistry::new();
        for m in modules {
            reg.register(Arc::new(m)).unwrap();
        }
        Arc::new(reg)
    }

    fn ctx_for(reg: &Arc<ModuleRegistry>) -> ModuleCtx {
        ModuleContextBuilder::new(reg).build()
    }

    #[test]
    fn topo_sort_happy_path() {
        let log = Log::default();
        let reg = build(vec![
            Probe::new("billing", &["base", "reports"], &log),
            Probe::new("reports", &["base"], &log),
            Probe::new("base", &[], &log),
        ]);
        assert_eq!(
            reg.resolve_order().unwrap(),
            vec!["base", "reports", "billing"]
        );
    }

    #[test]
    fn independent_modules_keep_registration_order() {
        let log = Log::default();
        let reg = build(vec![
            Probe::new("c", &[], &log),
            Probe::new("a", &[], &log),
            Probe::new("z", &["a"], &log),
            Probe::new("b", &[], &log),
        ]);
        assert_eq!(reg.resolve_order().unwrap(), vec!["c", "a", "z", "b"]);
    }

    #[test]
    fn duplicate_registration_leaves_registry_unchanged() {
        let log = Log::default();
        let mut reg = ModuleRegistry::new();
        reg.register(Arc::new(Probe::new("a", &[], &log))).unwrap();
        let err = reg
            .register(Arc::new(Probe::new("a", &["x"], &log)))
            .unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateModule { ref module } if module == "a"));
        assert_eq!(reg.len(), 1);
        assert!(reg.metadata()[0].dependencies.is_empty());
    }

    #[test]
    fn unknown_dependency_error() {
        let log = Log::default();
        let reg = build(vec![Probe::new("a", &["b"], &log)]);

        match reg.resolve_order().unwrap_err() {
            RegistryError::UnresolvedDependency { module, depends_on } => {
                assert_eq!(module, "a");
                assert_eq!(depends_on, "b");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cyclic_dependency_detected() {
        let log = Log::default();
        let reg = build(vec![
            Probe::new("a", &["b"], &log),
            Probe::new("b", &["a"], &log),
        ]);

        match reg.resolve_order().unwrap_err() {
            RegistryError::CyclicDependency { path } => {
                assert_eq!(path, vec!["a", "b", "a"]);
            }
            other => panic!("expected CyclicDependency, got: {other:?}"),
        }
    }

    #[test]
    fn complex_cycle_excludes_unrelated_modules() {
        let log = Log::default();
        let reg = build(vec![
            Probe::new("d", &[], &log),
            Probe::new("a", &["b"], &log),
            Probe::new("b", &["c"], &log),
            Probe::new("c", &["a"], &log),
        ]);

        let err = reg.resolve_order().unwrap_err();
        let msg = err.to_string();
        match err {
            RegistryError::CyclicDependency { path } => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
                assert!(msg.contains("a -> b -> c -> a"));
            }
            other => panic!("expected CyclicDependency, got: {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let log = Log::default();
        let reg = build(vec![Probe::new("a", &["a"], &log)]);
        assert!(matches!(
            reg.resolve_order(),
            Err(RegistryError::CyclicDependency { .. })
        ));
    }

    #[tokio::test]
    async fn lifecycle_runs_in_order_and_stops_in_reverse() {
        let log = Log::default();
        let reg = build(vec![
            Probe::new("billing", &["base", "reports"], &log),
            Probe::new("reports", &["base"], &log),
            Probe::new("base", &[], &log),
        ]);
        let ctx = ctx_for(&reg);
        let cancel = CancellationToken::new();

        reg.initialize_all(&ctx).await.unwrap();
        reg.start_all(&cancel).await.unwrap();
        let report = reg.stop_all(&cancel).await;

        assert!(report.is_clean());
        assert_eq!(report.stopped, vec!["billing", "reports", "base"]);
        assert_eq!(
            *log.lock(),
            vec![
                "init:base",
                "init:reports",
                "init:billing",
                "start:base",
                "start:reports",
                "start:billing",
                "stop:billing",
                "stop:reports",
                "stop:base",
            ]
        );
        assert_eq!(reg.state("base"), Some(ModuleState::Stopped));
        assert!(ctx.services().contains("billing.svc"));
        assert_eq!(ctx.services().owner_of("base.svc").as_deref(), Some("base"));
    }

    #[tokio::test]
    async fn init_failure_stops_the_sequence() {
        let log = Log::default();
        let mut failing = Probe::new("b", &["a"], &log);
        failing.fail_init = true;
        let reg = build(vec![
            Probe::new("a", &[], &log),
            failing,
            Probe::new("c", &["b"], &log),
        ]);
        let ctx = ctx_for(&reg);

        match reg.initialize_all(&ctx).await.unwrap_err() {
            RegistryError::Initialize {
                module,
                initialized_before,
                ..
            } => {
                assert_eq!(module, "b");
                assert_eq!(initialized_before, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(*log.lock(), vec!["init:a", "init:b"]);
        assert_eq!(reg.state("b"), Some(ModuleState::Failed));
        assert_eq!(reg.state("c"), Some(ModuleState::Registered));

        // nothing started, nothing to stop
        let report = reg.stop_all(&CancellationToken::new()).await;
        assert!(report.stopped.is_empty());
    }

    #[tokio::test]
    async fn stop_errors_do_not_abort_and_stop_is_idempotent() {
        let log = Log::default();
        let mut noisy = Probe::new("b", &["a"], &log);
        noisy.fail_stop = true;
        let reg = build(vec![Probe::new("a", &[], &log), noisy]);
        let ctx = ctx_for(&reg);
        let cancel = CancellationToken::new();

        reg.initialize_all(&ctx).await.unwrap();
        reg.start_all(&cancel).await.unwrap();

        let first = reg.stop_all(&cancel).await;
        assert_eq!(first.stopped, vec!["b", "a"]);
        assert_eq!(first.errors.len(), 1);
        assert_eq!(first.errors[0].module, "b");

        let second = reg.stop_all(&cancel).await;
        assert!(second.stopped.is_empty());
        assert_eq!(second.skipped, vec!["b", "a"]);
        let probe = reg.get_as::<Probe>("b").unwrap();
        assert_eq!(probe.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_stop_uses_its_share_and_dependencies_still_stop() {
        let log = Log::default();
        let mut stuck = Probe::new("reports", &["base"], &log);
        stuck.hang_stop = true;
        let reg = build(vec![Probe::new("base", &[], &log), stuck]);
        let ctx = ctx_for(&reg);
        let cancel = CancellationToken::new();

        reg.initialize_all(&ctx).await.unwrap();
        reg.start_all(&cancel).await.unwrap();

        let report = reg
            .stop_all_within(&cancel, Some(Duration::from_millis(200)))
            .await;
        assert_eq!(report.stopped, vec!["reports", "base"]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].module, "reports");
        assert!(report.errors[0].timed_out());
        assert!(report.timed_out());
        assert_eq!(*log.lock().last().unwrap(), "stop:base");
        assert_eq!(reg.state("base"), Some(ModuleState::Stopped));
        assert_eq!(reg.state("reports"), Some(ModuleState::Stopped));
    }

    #[tokio::test]
    async fn start_requires_initialize() {
        let log = Log::default();
        let reg = build(vec![Probe::new("a", &[], &log)]);
        assert!(matches!(
            reg.start_all(&CancellationToken::new()).await,
            Err(RegistryError::OrderNotResolved)
        ));
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let log = Log::default();
        let reg = build(vec![Probe::new("a", &[], &log)]);
        let ctx = ctx_for(&reg);
        reg.initialize_all(&ctx).await.unwrap();
        assert!(matches!(
            reg.initialize_all(&ctx).await,
            Err(RegistryError::AlreadyInitialized)
        ));
        assert_eq!(*log.lock(), vec!["init:a"]);
    }

    #[tokio::test]
    async fn hung_hook_times_out() {
        struct Hung;
        #[async_trait::async_trait]
        impl Module for Hung {
            fn name(&self) -> &str {
                "hung"
            }
            fn version(&self) -> &str {
                "0.0.1"
            }
            async fn initialize(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        let mut reg = ModuleRegistry::new();
        reg.set_hook_timeout(Some(Duration::from_millis(50)));
        reg.register(Arc::new(Hung)).unwrap();
        let reg = Arc::new(reg);
        let ctx = ctx_for(&reg);

        let err = reg.initialize_all(&ctx).await.unwrap_err();
        let RegistryError::Initialize { source, .. } = err else {
            panic!("expected Initialize error");
        };
        assert!(source.to_string().contains("timed out"));
    }
}
