//! Configuration module for fee-ledger-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FeeLedgerConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
}

/// Settings applied to every per-tenant connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    /// Upper bound per tenant pool. Kept small: one pool exists per school.
    pub tenant_max_connections: u32,
    pub tenant_idle_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub statement_timeout_ms: u64,
    /// Prefix of the schema derived from a tenant id, e.g. `school_`.
    pub schema_prefix: String,
    pub run_migrations: bool,
}

impl DatabaseConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tenant_idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl FeeLedgerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let config = Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "fee-ledger-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                tenant_max_connections: env_or("TENANT_POOL_MAX_CONNECTIONS", 5),
                tenant_idle_timeout_secs: env_or("TENANT_POOL_IDLE_TIMEOUT_SECS", 60),
                acquire_timeout_secs: env_or("DATABASE_ACQUIRE_TIMEOUT_SECS", 5),
                statement_timeout_ms: env_or("DATABASE_STATEMENT_TIMEOUT_MS", 15_000),
                schema_prefix: env::var("TENANT_SCHEMA_PREFIX")
                    .unwrap_or_else(|_| "school_".to_string()),
                run_migrations: env_or("RUN_TENANT_MIGRATIONS", true),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        let db = &self.database;
        if db.tenant_max_connections == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TENANT_POOL_MAX_CONNECTIONS must be at least 1"
            )));
        }
        if db.acquire_timeout_secs == 0 || db.statement_timeout_ms == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Database timeouts must be bounded and non-zero"
            )));
        }
        if db.schema_prefix.is_empty()
            || !db
                .schema_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            || db.schema_prefix.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TENANT_SCHEMA_PREFIX must be a lowercase identifier"
            )));
        }
        Ok(())
    }
}
