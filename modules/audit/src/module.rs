use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tracing::{info, warn};

use appkit::{EventHandler, Module, ModuleCtx, RouteProvider};
use users::{UsersDirectory, USERS_DIRECTORY};

use crate::api::rest::AuditRoutes;
use crate::config::AuditConfig;
use crate::domain::handler::UserEventsAuditor;
use crate::domain::trail::AuditTrail;

struct Wired {
    trail: Arc<AuditTrail>,
    directory: Option<Arc<dyn UsersDirectory>>,
}

/// In-memory audit trail of user lifecycle events.
#[derive(Default)]
pub struct AuditModule {
    wired: ArcSwapOption<Wired>,
}

impl AuditModule {
    pub const NAME: &'static str = "audit";

    pub fn trail(&self) -> Option<Arc<AuditTrail>> {
        self.wired.load().as_ref().map(|w| w.trail.clone())
    }
}

#[async_trait]
impl Module for AuditModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn dependencies(&self) -> Vec<&str> {
        vec![users::UsersModule::NAME]
    }

    async fn initialize(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let config: AuditConfig = ctx.config()?;

        // optional: entries are still recorded without the directory
        let directory = ctx
            .services()
            .try_get::<dyn UsersDirectory>(USERS_DIRECTORY);
        if directory.is_none() {
            warn!("Users directory not available, audit entries will not be enriched");
        }

        self.wired.store(Some(Arc::new(Wired {
            trail: Arc::new(AuditTrail::new(config.max_entries)),
            directory,
        })));
        info!(max_entries = config.max_entries, "Audit module initialized");
        Ok(())
    }

    fn routes(&self) -> Vec<Arc<dyn RouteProvider>> {
        self.trail()
            .map(|trail| Arc::new(AuditRoutes::new(trail)) as Arc<dyn RouteProvider>)
            .into_iter()
            .collect()
    }

    fn event_handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        match self.wired.load_full() {
            Some(w) => vec![Arc::new(UserEventsAuditor::new(
                w.trail.clone(),
                w.directory.clone(),
            ))],
            None => Vec::new(),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
