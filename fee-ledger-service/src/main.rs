//! Fee Ledger Service entry point.

use fee_ledger_service::config::FeeLedgerConfig;
use fee_ledger_service::startup::Application;

use service_core::observability::{init_tracing, shutdown_tracing};
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = FeeLedgerConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = %config.service_version,
        otlp_enabled = config.otlp_endpoint.is_some(),
        "Starting fee-ledger-service"
    );

    // Never log the database URL; it carries credentials.
    tracing::info!(
        http_port = config.common.port,
        tenant_max_connections = config.database.tenant_max_connections,
        tenant_idle_timeout_secs = config.database.tenant_idle_timeout_secs,
        acquire_timeout_secs = config.database.acquire_timeout_secs,
        statement_timeout_ms = config.database.statement_timeout_ms,
        schema_prefix = %config.database.schema_prefix,
        "Configuration loaded"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    let result = app.run_until_stopped(shutdown_signal()).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Application error");
    }

    tracing::info!("Service shutdown complete");
    shutdown_tracing();
    result
}
