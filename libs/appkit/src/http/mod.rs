//! Shared HTTP router and the built-in system endpoints.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{routing::get, Extension, Json, Router};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::context::ModuleCtx;
use crate::contracts::RouteProvider;
use crate::registry::{ModuleMetadata, ModuleRegistry, ModuleState};

mod problem;

pub use problem::{Problem, APPLICATION_PROBLEM_JSON};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route table is frozen, routes can no longer be added")]
    Frozen,
    #[error("module '{module}' declares invalid route prefix '{prefix}'")]
    InvalidPrefix { module: String, prefix: String },
    #[error("route prefix '{prefix}' of module '{module}' is already mounted by '{owner}'")]
    DuplicatePrefix {
        prefix: String,
        module: String,
        owner: String,
    },
    #[error("module '{module}' failed to register routes under '{prefix}'")]
    Register {
        module: String,
        prefix: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("routes of module '{module}' under '{prefix}' conflict with existing routes: {reason}")]
    Conflict {
        module: String,
        prefix: String,
        reason: String,
    },
}

impl RouteError {
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::Frozen => None,
            Self::InvalidPrefix { module, .. }
            | Self::DuplicatePrefix { module, .. }
            | Self::Register { module, .. }
            | Self::Conflict { module, .. } => Some(module),
        }
    }
}

struct TableState {
    router: Option<Router>,
    /// prefix → owning module
    prefixes: HashMap<String, String>,
}

/// Router under construction, shared through the module context.
///
/// Open until the orchestrator freezes it to start serving.
pub struct RouteTable {
    state: Mutex<TableState>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                router: Some(Router::new()),
                prefixes: HashMap::new(),
            }),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().router.is_none()
    }

    /// Mounted prefixes with their owning module, sorted by prefix.
    pub fn prefixes(&self) -> Vec<(String, String)> {
        let mut all: Vec<_> = self
            .state
            .lock()
            .prefixes
            .iter()
            .map(|(p, m)| (p.clone(), m.clone()))
            .collect();
        all.sort();
        all
    }

    /// Merge a ready-made router at the root.
    pub fn merge(&self, module: &str, router: Router) -> Result<(), RouteError> {
        let mut state = self.state.lock();
        let current = state.router.take().ok_or(RouteError::Frozen)?;
        let (merged, result) = combine(current, "", router, module);
        state.router = Some(merged);
        result
    }

    /// Builds the provider's group router, applies its middleware in order and
    /// mounts it under its prefix. Returns the normalized prefix.
    pub fn mount(
        &self,
        module: &str,
        provider: &dyn RouteProvider,
        ctx: &ModuleCtx,
    ) -> Result<String, RouteError> {
        let prefix = normalize_prefix(provider.prefix()).ok_or_else(|| {
            RouteError::InvalidPrefix {
                module: module.to_string(),
                prefix: provider.prefix().to_string(),
            }
        })?;

        if self.is_frozen() {
            return Err(RouteError::Frozen);
        }
        if !prefix.is_empty() {
            if let Some(owner) = self.state.lock().prefixes.get(&prefix) {
                return Err(RouteError::DuplicatePrefix {
                    prefix,
                    module: module.to_string(),
                    owner: owner.clone(),
                });
            }
        }

        // provider code runs without the table lock held
        let mut group = provider
            .register_routes(Router::new(), ctx)
            .map_err(|source| RouteError::Register {
                module: module.to_string(),
                prefix: prefix.clone(),
                source,
            })?;
        for middleware in provider.middleware() {
            tracing::debug!(module, prefix = %prefix, middleware = middleware.name(), "Applying route middleware");
            group = middleware.apply(group);
        }

        let mut state = self.state.lock();
        if !prefix.is_empty() {
            if let Some(owner) = state.prefixes.get(&prefix) {
                return Err(RouteError::DuplicatePrefix {
                    prefix,
                    module: module.to_string(),
                    owner: owner.clone(),
                });
            }
        }
        let current = state.router.take().ok_or(RouteError::Frozen)?;
        let (mounted, result) = combine(current, &prefix, group, module);
        state.router = Some(mounted);
        result?;
        if !prefix.is_empty() {
            state.prefixes.insert(prefix.clone(), module.to_string());
        }

        tracing::info!(module, prefix = %display_prefix(&prefix), "Routes mounted");
        Ok(prefix)
    }

    /// Takes the router out; every later mount or merge fails with `Frozen`.
    pub fn freeze(&self) -> Result<Router, RouteError> {
        self.state.lock().router.take().ok_or(RouteError::Frozen)
    }
}

/// `users` → `/users`, `/users/` → `/users`, `/` or empty → root (empty).
fn normalize_prefix(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Some(String::new());
    }
    let prefix = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    let valid = prefix
        .split('/')
        .skip(1)
        .all(|seg| !seg.is_empty() && !seg.contains(['{', '}', '*', ' ']));
    valid.then_some(prefix)
}

fn display_prefix(prefix: &str) -> &str {
    if prefix.is_empty() {
        "/"
    } else {
        prefix
    }
}

/// Axum panics on overlapping routes; turn that into an error and keep the
/// previous router intact.
fn combine(
    base: Router,
    prefix: &str,
    group: Router,
    module: &str,
) -> (Router, Result<(), RouteError>) {
    let candidate = base.clone();
    let attempt = std::panic::catch_unwind(AssertUnwindSafe(move || {
        if prefix.is_empty() {
            candidate.merge(group)
        } else {
            candidate.nest(prefix, group)
        }
    }));
    match attempt {
        Ok(router) => (router, Ok(())),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_string()))
                .unwrap_or_else(|| "overlapping routes".to_string());
            (
                base,
                Err(RouteError::Conflict {
                    module: module.to_string(),
                    prefix: display_prefix(prefix).to_string(),
                    reason,
                }),
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct ModuleView {
    #[serde(flatten)]
    meta: ModuleMetadata,
    state: Option<ModuleState>,
}

#[derive(Debug, Serialize)]
struct ModulesView {
    order: Vec<String>,
    modules: Vec<ModuleView>,
}

async fn list_modules(Extension(registry): Extension<Arc<ModuleRegistry>>) -> Json<ModulesView> {
    let modules = registry
        .metadata()
        .into_iter()
        .map(|meta| ModuleView {
            state: registry.state(&meta.name),
            meta,
        })
        .collect();
    Json(ModulesView {
        order: registry.order().unwrap_or_default(),
        modules,
    })
}

/// `GET /healthz` and `GET /system/modules`.
pub fn system_routes(registry: Arc<ModuleRegistry>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/system/modules", get(list_modules))
        .layer(Extension(registry))
}
