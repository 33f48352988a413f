//! Per-tenant connection pools.
//!
//! Each school gets its own small pool whose sessions are pinned to the
//! school's schema through `search_path`. Pools are created on first use and
//! cached; the registry is an explicit value owned by the application, not
//! process-wide state.

use crate::config::DatabaseConfig;
use crate::models::TenantId;
use crate::services::database::{classify, is_duplicate_ddl, ping, quote_ident};
use crate::services::metrics::{DB_QUERY_DURATION, TENANT_POOLS};
use dashmap::DashMap;
use service_core::error::AppError;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub struct TenantConnectionRegistry {
    settings: DatabaseConfig,
    base_options: PgConnectOptions,
    /// Single-connection pool outside any tenant schema, for health checks.
    control: PgPool,
    pools: DashMap<TenantId, Arc<OnceCell<PgPool>>>,
}

impl TenantConnectionRegistry {
    /// Parse the connection settings. No connection is opened here.
    pub fn new(settings: DatabaseConfig) -> Result<Self, AppError> {
        let base_options = PgConnectOptions::from_str(&settings.url).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid DATABASE_URL: {}", e))
        })?;

        let statement_timeout = settings.statement_timeout_ms.to_string();
        let control = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .acquire_timeout(settings.acquire_timeout())
            .idle_timeout(settings.idle_timeout())
            .connect_lazy_with(
                base_options
                    .clone()
                    .options([("statement_timeout", statement_timeout.as_str())]),
            );

        Ok(Self {
            settings,
            base_options,
            control,
            pools: DashMap::new(),
        })
    }

    pub fn schema_for(&self, tenant_id: &TenantId) -> String {
        tenant_id.schema_name(&self.settings.schema_prefix)
    }

    /// Return the tenant's pool, creating it on first access.
    ///
    /// Concurrent first callers for the same tenant wait on one
    /// initialisation. A failed initialisation leaves nothing cached, so the
    /// next caller tries again.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn get_connection(&self, tenant_id: &TenantId) -> Result<PgPool, AppError> {
        let cell = Arc::clone(&self.pools.entry(tenant_id.clone()).or_default());

        let pool = cell
            .get_or_try_init(|| self.connect(tenant_id))
            .await?
            .clone();

        Ok(pool)
    }

    async fn connect(&self, tenant_id: &TenantId) -> Result<PgPool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["connect_tenant"])
            .start_timer();

        let schema = self.schema_for(tenant_id);
        let statement_timeout = self.settings.statement_timeout_ms.to_string();

        info!(
            schema = %schema,
            max_connections = self.settings.tenant_max_connections,
            "Creating tenant connection pool"
        );

        let options = self.base_options.clone().options([
            ("search_path", schema.as_str()),
            ("statement_timeout", statement_timeout.as_str()),
        ]);

        let pool = PgPoolOptions::new()
            .max_connections(self.settings.tenant_max_connections)
            .min_connections(0)
            .acquire_timeout(self.settings.acquire_timeout())
            .idle_timeout(self.settings.idle_timeout())
            .connect_with(options)
            .await
            .map_err(|e| classify("connect tenant pool", e))?;

        if let Err(e) = self.prepare_schema(&pool, &schema).await {
            pool.close().await;
            return Err(e);
        }

        timer.observe_duration();
        self.refresh_gauge(1);

        info!(schema = %schema, "Tenant connection pool established");
        Ok(pool)
    }

    async fn prepare_schema(&self, pool: &PgPool, schema: &str) -> Result<(), AppError> {
        let ddl = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema));
        match sqlx::query(&ddl).execute(pool).await {
            Ok(_) => {}
            Err(e) if is_duplicate_ddl(&e) => {}
            Err(e) => return Err(classify("create tenant schema", e)),
        }

        if self.settings.run_migrations {
            MIGRATOR.run(pool).await.map_err(|e| match e {
                MigrateError::Execute(inner) => classify("migrate tenant schema", inner),
                other => AppError::DatabaseError(anyhow::anyhow!(
                    "Tenant migration failed: {}",
                    other
                )),
            })?;
        }
        Ok(())
    }

    /// Number of tenants with a live, cached pool.
    pub fn cached_tenants(&self) -> usize {
        self.pools
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    /// Drop and close one tenant's pool. Returns whether a pool was cached.
    pub async fn evict(&self, tenant_id: &TenantId) -> bool {
        let Some((_, cell)) = self.pools.remove(tenant_id) else {
            return false;
        };
        let Some(pool) = cell.get() else {
            return false;
        };
        pool.close().await;
        self.refresh_gauge(0);
        info!(tenant_id = %tenant_id, "Tenant connection pool evicted");
        true
    }

    /// Close every cached pool. Used during graceful shutdown.
    pub async fn shutdown(&self) {
        let pools: Vec<PgPool> = self
            .pools
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        self.pools.clear();

        for pool in pools {
            pool.close().await;
        }
        self.control.close().await;
        TENANT_POOLS.set(0);
        info!("All tenant connection pools closed");
    }

    /// Round trip to the server without touching any tenant schema.
    pub async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self
            .control
            .acquire()
            .await
            .map_err(|e| classify("acquire control connection", e))?;
        ping(&mut conn).await.map_err(|e| {
            warn!(error = %e, "Database health check failed");
            e
        })
    }

    fn refresh_gauge(&self, pending: usize) {
        TENANT_POOLS.set((self.cached_tenants() + pending) as i64);
    }
}
