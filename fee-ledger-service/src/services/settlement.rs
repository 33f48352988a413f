//! Derived pending/settled flag on demand rows.

use crate::models::{AcademicYear, FeeCategory, SettlementState, TenantId, SETTLED_EPSILON};
use crate::services::database::db_err;
use crate::services::metrics::{DB_QUERY_DURATION, STATUS_WRITES_TOTAL};
use crate::services::partition::YearPartitionResolver;
use crate::services::reconciler::BalanceReconciler;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{debug, instrument};

pub fn settlement_for(balance: Decimal) -> SettlementState {
    if balance <= SETTLED_EPSILON {
        SettlementState::Settled
    } else {
        SettlementState::Pending
    }
}

/// What a refresh computed and how many demand rows it rewrote.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRefresh {
    pub fee_head: String,
    pub state: SettlementState,
    pub balance: Decimal,
    pub rows_written: u64,
}

pub struct SettlementStatusUpdater {
    reconciler: Arc<BalanceReconciler>,
    partitions: Arc<YearPartitionResolver>,
}

impl SettlementStatusUpdater {
    pub fn new(reconciler: Arc<BalanceReconciler>, partitions: Arc<YearPartitionResolver>) -> Self {
        Self {
            reconciler,
            partitions,
        }
    }

    pub fn reconciler(&self) -> &BalanceReconciler {
        &self.reconciler
    }

    /// Recompute one head and write its state into every demand table that
    /// holds a row for it. Rows already in the computed state are not
    /// touched. `amount` is never written.
    #[instrument(skip(self, conn), fields(tenant_id = %tenant_id, fee_head = %fee_head))]
    pub async fn refresh_status(
        &self,
        conn: &mut PgConnection,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
        fee_head: &str,
    ) -> Result<StatusRefresh, AppError> {
        self.partitions.ensure_exists(tenant_id, academic_year).await?;

        let result = self
            .reconciler
            .reconcile_on(conn, tenant_id, admission_number, academic_year)
            .await?;

        let balance = result
            .head(fee_head)
            .map(|h| h.balance)
            .unwrap_or(Decimal::ZERO);
        let state = settlement_for(balance);

        let timer = DB_QUERY_DURATION
            .with_label_values(&["refresh_status"])
            .start_timer();

        let mut rows_written = 0;
        for category in FeeCategory::DEMAND_SOURCES {
            let table = self.partitions.resolve(tenant_id, academic_year, category);
            let sql = format!(
                r#"
                UPDATE {}
                SET settlement_state = $1, updated_utc = now()
                WHERE admission_number = $2 AND academic_year = $3 AND fee_head = $4
                  AND settlement_state <> $1
                "#,
                table.qualified()
            );
            let written = sqlx::query(&sql)
                .bind(state.as_str())
                .bind(admission_number)
                .bind(academic_year.as_str())
                .bind(fee_head)
                .execute(&mut *conn)
                .await
                .map_err(db_err("refresh settlement status"))?
                .rows_affected();
            rows_written += written;
        }

        timer.observe_duration();

        let outcome = if rows_written > 0 { "written" } else { "skipped" };
        STATUS_WRITES_TOTAL.with_label_values(&[outcome]).inc();
        debug!(state = %state, balance = %balance, rows_written, "Settlement status refreshed");

        Ok(StatusRefresh {
            fee_head: fee_head.to_string(),
            state,
            balance,
            rows_written,
        })
    }
}
