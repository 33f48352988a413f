//! Application startup and lifecycle management.

use crate::config::FeeLedgerConfig;
use crate::services::metrics::{get_metrics, init_metrics};
use crate::services::FeeLedger;
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: FeeLedgerConfig,
    pub ledger: Arc<FeeLedger>,
}

/// Liveness: the process is up and the database answers.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.registry().health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": state.config.service_name,
                    "version": state.config.service_version,
                    "tenant_pools": state.ledger.registry().cached_tenants()
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name,
                    "error": e.to_string()
                })),
            )
        }
    }
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.registry().health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the ledger and bind the listener. No tenant pool is opened until
    /// the first request for that tenant.
    pub async fn build(config: FeeLedgerConfig) -> Result<Self, AppError> {
        init_metrics();

        let ledger = Arc::new(FeeLedger::new(config.database.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to configure tenant registry");
            e
        })?);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port, "Fee ledger listener bound");

        Ok(Self {
            port,
            listener,
            state: AppState { config, ledger },
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ledger(&self) -> Arc<FeeLedger> {
        Arc::clone(&self.state.ledger)
    }

    /// Serve until `shutdown` resolves, then close every tenant pool within
    /// the configured grace period.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ledger = Arc::clone(&self.state.ledger);
        let grace = Duration::from_secs(self.state.config.common.shutdown_grace_secs);

        tracing::info!(
            service = %self.state.config.service_name,
            version = %self.state.config.service_version,
            port = self.port,
            "Service ready to accept connections"
        );

        let served = axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await;

        if tokio::time::timeout(grace, ledger.shutdown()).await.is_err() {
            tracing::warn!(grace_secs = grace.as_secs(), "Tenant pools did not close in time");
        }

        served.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
