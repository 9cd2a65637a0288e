use std::sync::Arc;

use axum::routing::{delete, get};
use axum::{Extension, Router};

use appkit::{require_auth, AuthProvider, Middleware, ModuleCtx, RouteProvider};

use crate::api::rest::handlers::{self, PageLimit};
use crate::domain::service::UsersService;

/// `/users` route group. Reads are public; deletes require a bearer token.
pub struct UsersRoutes {
    service: Arc<UsersService>,
    auth: Arc<dyn AuthProvider>,
    page_limit: u32,
}

impl UsersRoutes {
    pub fn new(service: Arc<UsersService>, auth: Arc<dyn AuthProvider>, page_limit: u32) -> Self {
        Self {
            service,
            auth,
            page_limit,
        }
    }
}

impl RouteProvider for UsersRoutes {
    fn prefix(&self) -> &str {
        "/users"
    }

    fn middleware(&self) -> Vec<Middleware> {
        let service = self.service.clone();
        let limit = PageLimit(self.page_limit);
        vec![Middleware::new("users_state", move |router: Router| {
            router
                .layer(Extension(service.clone()))
                .layer(Extension(limit))
        })]
    }

    fn register_routes(&self, router: Router, _ctx: &ModuleCtx) -> anyhow::Result<Router> {
        let protected = require_auth(self.auth.clone())
            .apply(Router::new().route("/{id}", delete(handlers::delete_user)));

        Ok(router
            .route("/", get(handlers::list_users).post(handlers::create_user))
            .route("/plans", get(handlers::list_plans))
            .route("/{id}", get(handlers::get_user))
            .merge(protected))
    }
}
