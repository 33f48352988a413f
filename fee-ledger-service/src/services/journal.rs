//! Day book: one credit/debit row per posted payment line.
//!
//! Rows are appended, and only rewritten in place when the payment line they
//! mirror is corrected. There are no compensating entries; this is a cash
//! journal, not double-entry bookkeeping.

use crate::models::{DateRange, DayBookEntry, NewDayBookEntry, TenantId};
use crate::services::database::db_err;
use crate::services::metrics::{record_error, DB_QUERY_DURATION};
use crate::services::registry::TenantConnectionRegistry;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

const ENTRY_COLUMNS: &str = "entry_id, academic_year, reference_number, student_ref, entry_date, \
     ledger_head, fee_head, credit, debit, mode, entry_seq, created_utc, restated_utc";

pub struct AccountingJournal {
    registry: Arc<TenantConnectionRegistry>,
}

impl AccountingJournal {
    pub fn new(registry: Arc<TenantConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Append one entry on the caller's transaction.
    pub async fn record(
        &self,
        conn: &mut PgConnection,
        entry: &NewDayBookEntry,
    ) -> Result<DayBookEntry, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_day_book"])
            .start_timer();

        let sql = format!(
            r#"
            INSERT INTO day_book (entry_id, academic_year, reference_number, student_ref,
                                  entry_date, ledger_head, fee_head, credit, debit, mode)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        );

        let row = sqlx::query_as::<_, DayBookEntry>(&sql)
            .bind(Uuid::new_v4())
            .bind(&entry.academic_year)
            .bind(&entry.reference_number)
            .bind(&entry.student_ref)
            .bind(entry.entry_date)
            .bind(&entry.ledger_head)
            .bind(&entry.fee_head)
            .bind(entry.credit)
            .bind(entry.debit)
            .bind(&entry.mode)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_err("record day book entry"))?;

        timer.observe_duration();
        Ok(row)
    }

    /// Rewrite the rows mirroring one payment line after a correction.
    ///
    /// The oldest row takes the corrected totals; any later rows for the same
    /// line are zeroed. Returns the number of rows touched.
    #[instrument(skip(self, conn), fields(reference_number = %reference_number, fee_head = %fee_head))]
    pub async fn restate_line(
        &self,
        conn: &mut PgConnection,
        academic_year: &str,
        reference_number: &str,
        student_ref: &str,
        fee_head: &str,
        credit: Decimal,
        debit: Decimal,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["restate_day_book"])
            .start_timer();

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT entry_id FROM day_book
            WHERE academic_year = $1 AND reference_number = $2
              AND student_ref = $3 AND fee_head = $4
            ORDER BY entry_seq
            FOR UPDATE
            "#,
        )
        .bind(academic_year)
        .bind(reference_number)
        .bind(student_ref)
        .bind(fee_head)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("load day book line"))?;

        let Some((first, rest)) = ids.split_first() else {
            error!("Payment line has no day book entries");
            record_error("integrity_error");
            return Err(AppError::Integrity(anyhow::anyhow!(
                "No day book entries for bill {} head '{}'",
                reference_number,
                fee_head
            )));
        };

        sqlx::query(
            "UPDATE day_book SET credit = $2, debit = $3, restated_utc = now() WHERE entry_id = $1",
        )
        .bind(first)
        .bind(credit)
        .bind(debit)
        .execute(&mut *conn)
        .await
        .map_err(db_err("restate day book entry"))?;

        if !rest.is_empty() {
            sqlx::query(
                "UPDATE day_book SET credit = 0, debit = 0, restated_utc = now() WHERE entry_id = ANY($1)",
            )
            .bind(rest)
            .execute(&mut *conn)
            .await
            .map_err(db_err("zero superseded day book entries"))?;
        }

        timer.observe_duration();
        Ok(ids.len() as u64)
    }

    /// Entries dated within `range`, oldest first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn day_book(
        &self,
        tenant_id: &TenantId,
        range: &DateRange,
    ) -> Result<Vec<DayBookEntry>, AppError> {
        range.validate()?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_day_book"])
            .start_timer();

        let pool = self.registry.get_connection(tenant_id).await?;
        let sql = format!(
            r#"
            SELECT {} FROM day_book
            WHERE entry_date BETWEEN $1 AND $2
            ORDER BY entry_date, entry_seq
            "#,
            ENTRY_COLUMNS
        );

        let entries = sqlx::query_as::<_, DayBookEntry>(&sql)
            .bind(range.from)
            .bind(range.to)
            .fetch_all(&pool)
            .await
            .map_err(db_err("get day book"))?;

        timer.observe_duration();
        info!(count = entries.len(), "Day book retrieved");
        Ok(entries)
    }
}
