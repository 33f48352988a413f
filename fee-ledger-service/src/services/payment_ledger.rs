//! Payment posting and correction.
//!
//! A post writes the payment line, the bill header, the day book row and the
//! refreshed settlement state in one transaction, under a per-student lock.

use crate::models::{
    AcademicYear, FeeCategory, NewDayBookEntry, PaymentBill, PaymentCorrection,
    PaymentTransaction, PostPayment, PostedPayment, TenantId,
};
use crate::services::database::{db_err, lock_student};
use crate::services::journal::AccountingJournal;
use crate::services::metrics::{record_error, DB_QUERY_DURATION, PAYMENTS_POSTED_TOTAL};
use crate::services::partition::YearPartitionResolver;
use crate::services::registry::TenantConnectionRegistry;
use crate::services::settlement::{settlement_for, SettlementStatusUpdater};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

const PAYMENT_COLUMNS: &str = "payment_id, academic_year, bill_number, admission_number, \
     fee_category, fee_head, account_head, paid_amount, concession_amount, payment_mode, \
     paid_on, posting_count, created_utc, updated_utc";

/// Every payment row for a student in a year, in posting order.
pub async fn load_payments(
    conn: &mut PgConnection,
    admission_number: &str,
    academic_year: &AcademicYear,
) -> Result<Vec<PaymentTransaction>, AppError> {
    let sql = format!(
        "SELECT {} FROM fee_payments WHERE admission_number = $1 AND academic_year = $2 ORDER BY payment_id",
        PAYMENT_COLUMNS
    );
    sqlx::query_as::<_, PaymentTransaction>(&sql)
        .bind(admission_number)
        .bind(academic_year.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("load payments"))
}

pub struct PaymentLedger {
    registry: Arc<TenantConnectionRegistry>,
    partitions: Arc<YearPartitionResolver>,
    journal: Arc<AccountingJournal>,
    settlement: Arc<SettlementStatusUpdater>,
}

impl PaymentLedger {
    pub fn new(
        registry: Arc<TenantConnectionRegistry>,
        partitions: Arc<YearPartitionResolver>,
        journal: Arc<AccountingJournal>,
        settlement: Arc<SettlementStatusUpdater>,
    ) -> Self {
        Self {
            registry,
            partitions,
            journal,
            settlement,
        }
    }

    /// Post a single payment line.
    pub async fn post_payment(
        &self,
        tenant_id: &TenantId,
        payment: PostPayment,
    ) -> Result<PostedPayment, AppError> {
        let mut posted = self.post_bill(tenant_id, &payment.into()).await?;
        posted.pop().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Posting returned no payment line"))
        })
    }

    /// Post every line of a bill atomically.
    ///
    /// Reposting an existing (bill, head, student) line adds to its amounts.
    #[instrument(
        skip(self, bill),
        fields(
            tenant_id = %tenant_id,
            bill_number = %bill.bill_number,
            admission_number = %bill.admission_number,
            academic_year = %bill.academic_year
        )
    )]
    pub async fn post_bill(
        &self,
        tenant_id: &TenantId,
        bill: &PaymentBill,
    ) -> Result<Vec<PostedPayment>, AppError> {
        bill.validate()?;
        for line in &bill.lines {
            line.validate()?;
        }
        let academic_year = AcademicYear::parse(&bill.academic_year)?;

        let result = self.write_bill(tenant_id, &academic_year, bill).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        PAYMENTS_POSTED_TOTAL
            .with_label_values(&[status])
            .inc_by(bill.lines.len() as f64);

        result
    }

    async fn write_bill(
        &self,
        tenant_id: &TenantId,
        academic_year: &AcademicYear,
        bill: &PaymentBill,
    ) -> Result<Vec<PostedPayment>, AppError> {
        self.partitions.ensure_exists(tenant_id, academic_year).await?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["post_bill"])
            .start_timer();

        let bill_number = bill.bill_number.trim();
        let admission_number = bill.admission_number.trim();

        let pool = self.registry.get_connection(tenant_id).await?;
        let mut tx = pool.begin().await.map_err(db_err("begin transaction"))?;

        lock_student(&mut tx, tenant_id, academic_year, admission_number).await?;

        let mut rows = Vec::with_capacity(bill.lines.len());
        let mut total_paid = Decimal::ZERO;
        let mut total_concession = Decimal::ZERO;

        for line in &bill.lines {
            let fee_head = line.fee_head.trim();
            let account_head = line.account_head.trim();

            let sql = format!(
                r#"
                INSERT INTO fee_payments (academic_year, bill_number, admission_number, fee_category,
                                          fee_head, account_head, paid_amount, concession_amount,
                                          payment_mode, paid_on)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT ON CONSTRAINT fee_payments_line_key DO UPDATE SET
                    paid_amount = fee_payments.paid_amount + EXCLUDED.paid_amount,
                    concession_amount = fee_payments.concession_amount + EXCLUDED.concession_amount,
                    posting_count = fee_payments.posting_count + 1,
                    updated_utc = now()
                RETURNING {}
                "#,
                PAYMENT_COLUMNS
            );

            let row = sqlx::query_as::<_, PaymentTransaction>(&sql)
                .bind(academic_year.as_str())
                .bind(bill_number)
                .bind(admission_number)
                .bind(line.fee_category.as_str())
                .bind(fee_head)
                .bind(account_head)
                .bind(line.paid_amount)
                .bind(line.concession_amount)
                .bind(bill.mode.as_str())
                .bind(bill.paid_on)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err("upsert payment line"))?;

            if row.fee_category != line.fee_category.as_str() {
                warn!(
                    fee_head = %fee_head,
                    stored = %row.fee_category,
                    posted = %line.fee_category,
                    "Fee category differs from the existing bill line"
                );
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Bill {} already holds head '{}' under category {}",
                    bill_number,
                    fee_head,
                    row.fee_category
                )));
            }

            self.journal
                .record(
                    &mut tx,
                    &NewDayBookEntry {
                        academic_year: academic_year.to_string(),
                        reference_number: bill_number.to_string(),
                        student_ref: admission_number.to_string(),
                        entry_date: bill.paid_on,
                        ledger_head: account_head.to_string(),
                        fee_head: fee_head.to_string(),
                        credit: line.paid_amount,
                        debit: line.concession_amount,
                        mode: bill.mode.as_str().to_string(),
                    },
                )
                .await?;

            total_paid += line.paid_amount;
            total_concession += line.concession_amount;
            rows.push((line.fee_category, row));
        }

        sqlx::query(
            r#"
            INSERT INTO fee_receipts (academic_year, bill_number, admission_number,
                                      total_paid, total_concession, payment_mode, paid_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (academic_year, bill_number, admission_number) DO UPDATE SET
                total_paid = fee_receipts.total_paid + EXCLUDED.total_paid,
                total_concession = fee_receipts.total_concession + EXCLUDED.total_concession,
                updated_utc = now()
            "#,
        )
        .bind(academic_year.as_str())
        .bind(bill_number)
        .bind(admission_number)
        .bind(total_paid)
        .bind(total_concession)
        .bind(bill.mode.as_str())
        .bind(bill.paid_on)
        .execute(&mut *tx)
        .await
        .map_err(db_err("upsert bill header"))?;

        let posted = self
            .settle(&mut tx, tenant_id, admission_number, academic_year, rows)
            .await?;

        tx.commit().await.map_err(db_err("commit payment"))?;
        timer.observe_duration();

        info!(
            lines = posted.len(),
            total_paid = %total_paid,
            total_concession = %total_concession,
            "Bill posted"
        );

        Ok(posted)
    }

    /// Refresh status once per head touched and pair it with each row.
    /// Arrear collections settle against outstanding arrears instead.
    async fn settle(
        &self,
        conn: &mut PgConnection,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
        rows: Vec<(FeeCategory, PaymentTransaction)>,
    ) -> Result<Vec<PostedPayment>, AppError> {
        let heads: BTreeSet<&str> = rows
            .iter()
            .filter(|(category, _)| category.is_demand_source())
            .map(|(_, row)| row.fee_head.as_str())
            .collect();

        let mut refreshed = Vec::with_capacity(heads.len());
        for head in heads {
            refreshed.push(
                self.settlement
                    .refresh_status(conn, tenant_id, admission_number, academic_year, head)
                    .await?,
            );
        }

        let arrears_outstanding = if rows.iter().any(|(c, _)| !c.is_demand_source()) {
            let result = self
                .settlement
                .reconciler()
                .reconcile_on(conn, tenant_id, admission_number, academic_year)
                .await?;
            result.arrears.outstanding
        } else {
            Decimal::ZERO
        };

        let mut posted = Vec::with_capacity(rows.len());
        for (category, row) in rows {
            let (settlement_state, head_balance) = if category.is_demand_source() {
                match refreshed.iter().find(|r| r.fee_head == row.fee_head) {
                    Some(r) => (r.state, r.balance),
                    None => {
                        record_error("integrity_error");
                        return Err(AppError::Integrity(anyhow::anyhow!(
                            "Head '{}' was posted but not refreshed",
                            row.fee_head
                        )));
                    }
                }
            } else {
                (settlement_for(arrears_outstanding), arrears_outstanding)
            };
            posted.push(PostedPayment {
                transaction: row,
                settlement_state,
                head_balance,
            });
        }
        Ok(posted)
    }

    /// Replace the amounts on an existing line.
    ///
    /// The day book rows for the line are restated in place and the bill
    /// header is adjusted by the difference. The head's state is recomputed,
    /// so a reduced line can move a settled head back to pending.
    #[instrument(
        skip(self, correction),
        fields(
            tenant_id = %tenant_id,
            bill_number = %correction.bill_number,
            admission_number = %correction.admission_number,
            fee_head = %correction.fee_head
        )
    )]
    pub async fn correct_payment(
        &self,
        tenant_id: &TenantId,
        correction: &PaymentCorrection,
    ) -> Result<PostedPayment, AppError> {
        correction.validate()?;
        let academic_year = AcademicYear::parse(&correction.academic_year)?;
        self.partitions.ensure_exists(tenant_id, &academic_year).await?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["correct_payment"])
            .start_timer();

        let bill_number = correction.bill_number.trim();
        let admission_number = correction.admission_number.trim();
        let fee_head = correction.fee_head.trim();

        let pool = self.registry.get_connection(tenant_id).await?;
        let mut tx = pool.begin().await.map_err(db_err("begin transaction"))?;

        lock_student(&mut tx, tenant_id, &academic_year, admission_number).await?;

        let select = format!(
            r#"
            SELECT {} FROM fee_payments
            WHERE academic_year = $1 AND bill_number = $2 AND fee_head = $3 AND admission_number = $4
            FOR UPDATE
            "#,
            PAYMENT_COLUMNS
        );
        let existing = sqlx::query_as::<_, PaymentTransaction>(&select)
            .bind(academic_year.as_str())
            .bind(bill_number)
            .bind(fee_head)
            .bind(admission_number)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("load payment line"))?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No payment line for bill {} head '{}'",
                    bill_number,
                    fee_head
                ))
            })?;

        let update = format!(
            r#"
            UPDATE fee_payments
            SET paid_amount = $2, concession_amount = $3, updated_utc = now()
            WHERE payment_id = $1
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentTransaction>(&update)
            .bind(existing.payment_id)
            .bind(correction.paid_amount)
            .bind(correction.concession_amount)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("correct payment line"))?;

        sqlx::query(
            r#"
            UPDATE fee_receipts
            SET total_paid = total_paid + $4,
                total_concession = total_concession + $5,
                updated_utc = now()
            WHERE academic_year = $1 AND bill_number = $2 AND admission_number = $3
            "#,
        )
        .bind(academic_year.as_str())
        .bind(bill_number)
        .bind(admission_number)
        .bind(row.paid_amount - existing.paid_amount)
        .bind(row.concession_amount - existing.concession_amount)
        .execute(&mut *tx)
        .await
        .map_err(db_err("adjust bill header"))?;

        self.journal
            .restate_line(
                &mut tx,
                academic_year.as_str(),
                bill_number,
                admission_number,
                fee_head,
                row.paid_amount,
                row.concession_amount,
            )
            .await?;

        let category = FeeCategory::from_str(&row.fee_category).ok_or_else(|| {
            AppError::Integrity(anyhow::anyhow!(
                "Unknown fee category '{}' on payment {}",
                row.fee_category,
                row.payment_id
            ))
        })?;

        let mut posted = self
            .settle(
                &mut tx,
                tenant_id,
                admission_number,
                &academic_year,
                vec![(category, row)],
            )
            .await?;

        tx.commit().await.map_err(db_err("commit correction"))?;
        timer.observe_duration();

        let posted = posted.pop().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Correction returned no payment line"))
        })?;

        info!(
            previous_paid = %existing.paid_amount,
            paid = %posted.transaction.paid_amount,
            concession = %posted.transaction.concession_amount,
            state = %posted.settlement_state,
            reason = %correction.reason,
            "Payment corrected"
        );

        Ok(posted)
    }

    /// Payment rows for a student in a year.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn payments_for(
        &self,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<Vec<PaymentTransaction>, AppError> {
        let pool = self.registry.get_connection(tenant_id).await?;
        let mut conn = pool.acquire().await.map_err(db_err("acquire connection"))?;
        load_payments(&mut conn, admission_number, academic_year).await
    }
}
