//! Pluggable request authentication.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::Request, middleware::Next, response::IntoResponse, response::Response, Router};
use http::header::AUTHORIZATION;
use thiserror::Error;

use appkit_bootstrap::AuthConfig;

use crate::contracts::Middleware;
use crate::http::Problem;

/// The authenticated caller, available to handlers as `Extension<Principal>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

impl Principal {
    pub const SYSTEM: &'static str = "system";

    pub fn system() -> Self {
        Self {
            subject: Self::SYSTEM.to_string(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid bearer token")]
    InvalidToken,
}

pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;

    /// `token` is `None` when the request carried no bearer token.
    fn authenticate(&self, token: Option<&str>) -> Result<Principal, AuthError>;
}

/// Every caller is the system principal.
pub struct DisabledAuth;

impl AuthProvider for DisabledAuth {
    fn name(&self) -> &str {
        "disabled"
    }

    fn authenticate(&self, _token: Option<&str>) -> Result<Principal, AuthError> {
        Ok(Principal::system())
    }
}

/// Fixed token → subject table.
pub struct StaticTokenAuth {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuth {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl AuthProvider for StaticTokenAuth {
    fn name(&self) -> &str {
        "static_tokens"
    }

    fn authenticate(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        self.tokens
            .get(token)
            .map(|subject| Principal {
                subject: subject.clone(),
            })
            .ok_or(AuthError::InvalidToken)
    }
}

/// Adapter selected by the `auth` config section.
pub fn auth_from_config(cfg: &AuthConfig) -> Arc<dyn AuthProvider> {
    if cfg.disabled {
        tracing::warn!("Authentication is DISABLED, every request runs as the system principal");
        Arc::new(DisabledAuth)
    } else {
        tracing::info!(tokens = cfg.tokens.len(), "Static token authentication enabled");
        Arc::new(StaticTokenAuth::new(cfg.tokens.clone()))
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

async fn authenticate_request(
    provider: Arc<dyn AuthProvider>,
    mut req: Request,
    next: Next,
) -> Response {
    match provider.authenticate(bearer_token(&req)) {
        Ok(principal) => {
            tracing::debug!(subject = %principal.subject, path = %req.uri().path(), "Request authenticated");
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(e) => {
            tracing::debug!(error = %e, path = %req.uri().path(), "Request rejected");
            Problem::unauthorized(e.to_string()).into_response()
        }
    }
}

/// Route middleware: rejects unauthenticated requests with a 401 problem and
/// exposes the [`Principal`] to handlers.
pub fn require_auth(provider: Arc<dyn AuthProvider>) -> Middleware {
    Middleware::new("require_auth", move |router: Router| {
        let provider = provider.clone();
        router.route_layer(axum::middleware::from_fn(move |req: Request, next: Next| {
            authenticate_request(provider.clone(), req, next)
        }))
    })
}
