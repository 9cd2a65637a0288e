use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use appkit::{
    AuthProvider, EntityDescriptor, FnServiceProvider, Module, ModuleCtx, RouteProvider, Seeder,
    ServiceHandle, ServiceProvider,
};

use crate::api::rest::routes::UsersRoutes;
use crate::config::UsersConfig;
use crate::contract::{UsersDirectory, USERS_DIRECTORY};
use crate::domain::entities::entities;
use crate::domain::service::UsersService;

/// State built during `initialize`.
struct Wired {
    service: Arc<UsersService>,
    auth: Arc<dyn AuthProvider>,
    config: UsersConfig,
}

/// User accounts: `users`/`plans` tables, `/users` REST group, user events and
/// the `users.directory` service.
#[derive(Default)]
pub struct UsersModule {
    wired: ArcSwapOption<Wired>,
}

impl UsersModule {
    pub const NAME: &'static str = "users";

    pub fn service(&self) -> Option<Arc<UsersService>> {
        self.wired.load().as_ref().map(|w| w.service.clone())
    }

    fn require(&self) -> anyhow::Result<Arc<Wired>> {
        self.wired
            .load_full()
            .ok_or_else(|| anyhow::anyhow!("users module is not initialized"))
    }
}

#[async_trait]
impl Module for UsersModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        info!("Initializing users module");

        let config: UsersConfig = ctx.config()?;
        config.validate()?;
        debug!(
            default_plan = %config.default_plan,
            plans = config.plans.len(),
            max_page_size = config.max_page_size,
            "Loaded users config"
        );

        let service = UsersService::new(
            ctx.sql_pool()?,
            ctx.events().clone(),
            config.default_plan.clone(),
        );
        self.wired.store(Some(Arc::new(Wired {
            service: Arc::new(service),
            auth: ctx.auth().clone(),
            config,
        })));
        Ok(())
    }

    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        let wired = self.require()?;
        let users = wired.service.count_users().await?;
        info!(users, "Users module started");
        Ok(())
    }

    fn entities(&self) -> Vec<EntityDescriptor> {
        entities()
    }

    fn routes(&self) -> Vec<Arc<dyn RouteProvider>> {
        match self.wired.load_full() {
            Some(w) => vec![Arc::new(UsersRoutes::new(
                w.service.clone(),
                w.auth.clone(),
                w.config.max_page_size,
            ))],
            None => Vec::new(),
        }
    }

    fn services(&self) -> Vec<Arc<dyn ServiceProvider>> {
        let wired = self.wired.load_full();
        vec![Arc::new(FnServiceProvider::new(USERS_DIRECTORY, move |_ctx| {
            let wired = wired
                .clone()
                .ok_or_else(|| anyhow::anyhow!("users module is not initialized"))?;
            let directory: Arc<dyn UsersDirectory> = wired.service.clone();
            Ok(ServiceHandle::new(directory))
        }))]
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_seeder(&self) -> Option<&dyn Seeder> {
        Some(self)
    }
}

#[async_trait]
impl Seeder for UsersModule {
    async fn seed(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        let wired = self.require()?;
        let inserted = wired.service.seed_plans(&wired.config.plans).await?;
        info!(inserted, "Baseline plans seeded");
        Ok(())
    }
}
