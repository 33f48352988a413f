//! Bill and receipt numbering.
//!
//! A 4-digit zero-padded counter per (tenant, academic year, series) that
//! wraps from 5000 back to 1. Receipts render as `In0042`, payment entries as
//! `0042`.

use crate::models::{AcademicYear, BillSeries, TenantId};
use crate::services::database::db_err;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::registry::TenantConnectionRegistry;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, instrument};

pub const BILL_COUNTER_MAX: i32 = 5000;

/// Counter value following `previous`. Out-of-range values restart at 1.
pub fn next_counter(previous: i32) -> i32 {
    if (1..BILL_COUNTER_MAX).contains(&previous) {
        previous + 1
    } else {
        1
    }
}

pub fn format_bill_number(series: BillSeries, counter: i32) -> String {
    format!("{}{:04}", series.prefix(), counter)
}

pub struct BillNumberGenerator {
    registry: Arc<TenantConnectionRegistry>,
}

impl BillNumberGenerator {
    pub fn new(registry: Arc<TenantConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Allocate the next number.
    ///
    /// The counter row is seeded at the maximum so the first allocation wraps
    /// to `0001`; after that the row lock serialises concurrent callers.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, academic_year = %academic_year))]
    pub async fn next(
        &self,
        tenant_id: &TenantId,
        academic_year: &AcademicYear,
        series: BillSeries,
    ) -> Result<String, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["next_bill_number"])
            .start_timer();

        let pool = self.registry.get_connection(tenant_id).await?;
        let mut tx = pool.begin().await.map_err(db_err("begin transaction"))?;

        sqlx::query(
            r#"
            INSERT INTO bill_counters (academic_year, series, last_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (academic_year, series) DO NOTHING
            "#,
        )
        .bind(academic_year.as_str())
        .bind(series.as_str())
        .bind(BILL_COUNTER_MAX)
        .execute(&mut *tx)
        .await
        .map_err(db_err("seed bill counter"))?;

        let previous: i32 = sqlx::query_scalar(
            r#"
            SELECT last_value FROM bill_counters
            WHERE academic_year = $1 AND series = $2
            FOR UPDATE
            "#,
        )
        .bind(academic_year.as_str())
        .bind(series.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("lock bill counter"))?;

        let value = next_counter(previous);

        sqlx::query(
            r#"
            UPDATE bill_counters
            SET last_value = $3, updated_utc = now()
            WHERE academic_year = $1 AND series = $2
            "#,
        )
        .bind(academic_year.as_str())
        .bind(series.as_str())
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(db_err("advance bill counter"))?;

        tx.commit().await.map_err(db_err("commit bill counter"))?;
        timer.observe_duration();

        let number = format_bill_number(series, value);
        debug!(bill_number = %number, "Bill number allocated");
        Ok(number)
    }
}
