use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use appkit::{ModuleCtx, RouteProvider};

use crate::domain::trail::{AuditEntry, AuditTrail};

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct EntriesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[tracing::instrument(name = "audit.entries", skip(trail))]
pub async fn list_entries(
    Extension(trail): Extension<Arc<AuditTrail>>,
    Query(query): Query<EntriesQuery>,
) -> Json<Vec<AuditEntry>> {
    Json(trail.recent(query.limit.unwrap_or(DEFAULT_LIMIT)))
}

pub struct AuditRoutes {
    trail: Arc<AuditTrail>,
}

impl AuditRoutes {
    pub fn new(trail: Arc<AuditTrail>) -> Self {
        Self { trail }
    }
}

impl RouteProvider for AuditRoutes {
    fn prefix(&self) -> &str {
        "/audit"
    }

    fn register_routes(&self, router: Router, _ctx: &ModuleCtx) -> anyhow::Result<Router> {
        Ok(router
            .route("/entries", get(list_entries))
            .layer(Extension(self.trail.clone())))
    }
}
