//! Shutdown triggers for a running application.

use std::{future::Future, pin::Pin};

use tokio_util::sync::CancellationToken;

/// How the runtime should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

impl ShutdownOptions {
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::Future(Box::pin(fut))
    }
}

/// Resolves once the configured trigger fires.
pub(crate) async fn wait_for_trigger(options: ShutdownOptions) {
    match options {
        ShutdownOptions::Signals => match appkit_bootstrap::wait_for_shutdown().await {
            Ok(signal) => tracing::info!(%signal, "shutdown: signal received"),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "shutdown: primary waiter failed; falling back to ctrl_c()"
                );
                let _ = tokio::signal::ctrl_c().await;
            }
        },
        ShutdownOptions::Token(token) => {
            token.cancelled().await;
            tracing::info!("shutdown: external token cancelled");
        }
        ShutdownOptions::Future(waiter) => {
            waiter.await;
            tracing::info!("shutdown: external future completed");
        }
    }
}
