//! Arrears and withdrawal (transfer certificate) issuance.

use crate::models::{
    AcademicYear, ArrearDirection, ArrearRecord, ArrearSource, CertificateIssue, FeeCategory,
    IssueCertificate, NewArrear, PlannedArrear, ReconciliationResult, TenantId,
    TransferCertificate, MATERIAL_BALANCE, SETTLED_EPSILON,
};
use crate::services::database::{db_err, is_unique_violation, lock_student};
use crate::services::demand::ARREAR_COLUMNS;
use crate::services::metrics::{ARREARS_CREATED_TOTAL, CERTIFICATES_TOTAL, DB_QUERY_DURATION};
use crate::services::partition::{PartitionTable, YearPartitionResolver};
use crate::services::reconciler::BalanceReconciler;
use crate::services::registry::TenantConnectionRegistry;
use crate::services::student::StudentDirectory;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Where a withdrawal attempt stands before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub enum WithdrawalPlan {
    /// Nothing outstanding; the certificate can be issued as is.
    Eligible,
    /// Balance outstanding. Issuable only when forced, shifting these arrears.
    Blocked {
        total_balance: Decimal,
        arrears: Vec<PlannedArrear>,
    },
    AlreadyIssued,
}

impl WithdrawalPlan {
    /// Amount that would be moved into arrears if the plan is carried out.
    pub fn shifted(&self) -> Decimal {
        match self {
            Self::Blocked { arrears, .. } => arrears.iter().map(|a| a.amount).sum(),
            _ => Decimal::ZERO,
        }
    }
}

pub fn plan_withdrawal(result: &ReconciliationResult, already_issued: bool) -> WithdrawalPlan {
    if already_issued {
        return WithdrawalPlan::AlreadyIssued;
    }
    if result.total_balance <= SETTLED_EPSILON {
        return WithdrawalPlan::Eligible;
    }

    let arrears = result
        .per_head_balances
        .iter()
        .filter(|h| h.balance > MATERIAL_BALANCE)
        .map(|h| PlannedArrear {
            fee_head: h.fee_head.clone(),
            account_head: h
                .account_head
                .clone()
                .unwrap_or_else(|| h.fee_head.clone()),
            amount: h.balance,
        })
        .collect();

    WithdrawalPlan::Blocked {
        total_balance: result.total_balance,
        arrears,
    }
}

pub struct ArrearCarryForwardService {
    registry: Arc<TenantConnectionRegistry>,
    partitions: Arc<YearPartitionResolver>,
    reconciler: Arc<BalanceReconciler>,
    students: Arc<dyn StudentDirectory>,
}

impl ArrearCarryForwardService {
    pub fn new(
        registry: Arc<TenantConnectionRegistry>,
        partitions: Arc<YearPartitionResolver>,
        reconciler: Arc<BalanceReconciler>,
        students: Arc<dyn StudentDirectory>,
    ) -> Self {
        Self {
            registry,
            partitions,
            reconciler,
            students,
        }
    }

    /// Withdraw a student and issue the transfer certificate.
    ///
    /// A remaining balance blocks issuance unless `force` is set, in which
    /// case each materially outstanding head becomes an OUT arrear and the
    /// certificate records the amount shifted.
    #[instrument(
        skip(self, request),
        fields(
            tenant_id = %tenant_id,
            admission_number = %request.admission_number,
            academic_year = %request.academic_year
        )
    )]
    pub async fn issue_certificate(
        &self,
        tenant_id: &TenantId,
        request: &IssueCertificate,
    ) -> Result<CertificateIssue, AppError> {
        request.validate()?;
        let academic_year = AcademicYear::parse(&request.academic_year)?;
        let admission_number = request.admission_number.trim();

        if self
            .students
            .find(tenant_id, admission_number)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Student {} not found",
                admission_number
            )));
        }

        self.partitions.ensure_exists(tenant_id, &academic_year).await?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["issue_certificate"])
            .start_timer();

        let pool = self.registry.get_connection(tenant_id).await?;
        let mut tx = pool.begin().await.map_err(db_err("begin transaction"))?;

        lock_student(&mut tx, tenant_id, &academic_year, admission_number).await?;

        let already_issued: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM transfer_certificates
                WHERE academic_year = $1 AND admission_number = $2
            )
            "#,
        )
        .bind(academic_year.as_str())
        .bind(admission_number)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("check certificate"))?;

        let result = self
            .reconciler
            .reconcile_on(&mut tx, tenant_id, admission_number, &academic_year)
            .await?;

        let plan = plan_withdrawal(&result, already_issued);
        let (outcome, planned) = match plan {
            WithdrawalPlan::AlreadyIssued => {
                CERTIFICATES_TOTAL.with_label_values(&["already_issued"]).inc();
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Certificate already issued for {} in {}",
                    admission_number,
                    academic_year
                )));
            }
            WithdrawalPlan::Blocked { total_balance, .. } if !request.force => {
                CERTIFICATES_TOTAL.with_label_values(&["blocked"]).inc();
                info!(total_balance = %total_balance, "Certificate blocked by outstanding balance");
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Outstanding balance {} must be cleared or shifted to arrears",
                    total_balance
                )));
            }
            WithdrawalPlan::Blocked {
                total_balance,
                arrears,
            } => {
                let shifted: Decimal = arrears.iter().map(|a| a.amount).sum();
                let residue = total_balance - shifted;
                if residue > Decimal::ZERO {
                    warn!(
                        residue = %residue,
                        "Balance below the carry-forward threshold left unshifted"
                    );
                }
                ("forced", arrears)
            }
            WithdrawalPlan::Eligible => ("eligible", Vec::new()),
        };

        let fee_balance_shifted: Decimal = planned.iter().map(|a| a.amount).sum();
        let certificate = insert_certificate(
            &mut tx,
            &academic_year,
            admission_number,
            fee_balance_shifted,
            request.issued_on,
        )
        .await?;

        let table = self
            .partitions
            .resolve(tenant_id, &academic_year, FeeCategory::Arrear);
        let mut arrears = Vec::with_capacity(planned.len());
        for p in &planned {
            let record = insert_arrear(
                &mut tx,
                &table,
                tenant_id,
                &academic_year,
                admission_number,
                &p.fee_head,
                &p.account_head,
                p.amount,
                ArrearDirection::Out,
                ArrearSource::Withdrawal,
                Some(certificate.certificate_id),
            )
            .await?;
            arrears.push(record);
        }

        tx.commit().await.map_err(db_err("commit certificate"))?;
        timer.observe_duration();

        CERTIFICATES_TOTAL.with_label_values(&[outcome]).inc();
        if !arrears.is_empty() {
            ARREARS_CREATED_TOTAL
                .with_label_values(&[ArrearSource::Withdrawal.as_str()])
                .inc_by(arrears.len() as f64);
        }

        info!(
            certificate_id = %certificate.certificate_id,
            fee_balance_shifted = %certificate.fee_balance_shifted,
            arrears = arrears.len(),
            "Transfer certificate issued"
        );

        Ok(CertificateIssue {
            certificate,
            arrears,
        })
    }

    /// Record an operator-entered due brought into the year.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, fee_head = %input.fee_head))]
    pub async fn record_arrear(
        &self,
        tenant_id: &TenantId,
        input: &NewArrear,
    ) -> Result<ArrearRecord, AppError> {
        input.validate()?;
        let academic_year = AcademicYear::parse(&input.academic_year)?;

        self.partitions.ensure_exists(tenant_id, &academic_year).await?;

        let table = self
            .partitions
            .resolve(tenant_id, &academic_year, FeeCategory::Arrear);
        let pool = self.registry.get_connection(tenant_id).await?;
        let mut conn = pool.acquire().await.map_err(db_err("acquire connection"))?;

        let record = insert_arrear(
            &mut conn,
            &table,
            tenant_id,
            &academic_year,
            input.admission_number.trim(),
            input.fee_head.trim(),
            input.account_head.trim(),
            input.amount,
            ArrearDirection::In,
            ArrearSource::Manual,
            None,
        )
        .await?;

        ARREARS_CREATED_TOTAL
            .with_label_values(&[ArrearSource::Manual.as_str()])
            .inc();
        info!(arrear_id = record.arrear_id, amount = %record.amount, "Manual arrear recorded");

        Ok(record)
    }
}

async fn insert_certificate(
    conn: &mut PgConnection,
    academic_year: &AcademicYear,
    admission_number: &str,
    fee_balance_shifted: Decimal,
    issued_on: NaiveDate,
) -> Result<TransferCertificate, AppError> {
    sqlx::query_as::<_, TransferCertificate>(
        r#"
        INSERT INTO transfer_certificates (certificate_id, academic_year, admission_number,
                                           fee_balance_shifted, issued_on)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING certificate_id, academic_year, admission_number, fee_balance_shifted,
                  issued_on, created_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(academic_year.as_str())
    .bind(admission_number)
    .bind(fee_balance_shifted)
    .bind(issued_on)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            CERTIFICATES_TOTAL.with_label_values(&["already_issued"]).inc();
            AppError::Conflict(anyhow::anyhow!(
                "Certificate already issued for {} in {}",
                admission_number,
                academic_year
            ))
        } else {
            db_err("insert certificate")(e)
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn insert_arrear(
    conn: &mut PgConnection,
    table: &PartitionTable,
    tenant_id: &TenantId,
    academic_year: &AcademicYear,
    admission_number: &str,
    fee_head: &str,
    account_head: &str,
    amount: Decimal,
    direction: ArrearDirection,
    source: ArrearSource,
    certificate_id: Option<Uuid>,
) -> Result<ArrearRecord, AppError> {
    let sql = format!(
        r#"
        INSERT INTO {} (tenant_id, academic_year, admission_number, fee_head, account_head,
                        amount, direction, source, certificate_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {}
        "#,
        table.qualified(),
        ARREAR_COLUMNS
    );

    sqlx::query_as::<_, ArrearRecord>(&sql)
        .bind(tenant_id.as_str())
        .bind(academic_year.as_str())
        .bind(admission_number)
        .bind(fee_head)
        .bind(account_head)
        .bind(amount)
        .bind(direction.as_str())
        .bind(source.as_str())
        .bind(certificate_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("insert arrear"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArrearSummary, BalanceBucket, HeadBalance};

    fn head(name: &str, balance: Decimal) -> HeadBalance {
        HeadBalance {
            fee_head: name.to_string(),
            account_head: Some(format!("{} A/c", name)),
            bucket: BalanceBucket::classify(name),
            demand: balance,
            paid: Decimal::ZERO,
            concession: Decimal::ZERO,
            balance,
            virtual_demand: false,
        }
    }

    fn result(heads: Vec<HeadBalance>) -> ReconciliationResult {
        let total = heads.iter().map(|h| h.balance).sum();
        ReconciliationResult {
            admission_number: "A100".to_string(),
            academic_year: "2024-2025".to_string(),
            academic_balance: total,
            transport_balance: Decimal::ZERO,
            total_balance: total,
            per_head_balances: heads,
            arrears: ArrearSummary::default(),
        }
    }

    #[test]
    fn settled_student_is_eligible() {
        let r = result(vec![head("Tuition", Decimal::ZERO)]);
        assert_eq!(plan_withdrawal(&r, false), WithdrawalPlan::Eligible);
    }

    #[test]
    fn existing_certificate_wins_over_balance() {
        let r = result(vec![head("Tuition", Decimal::new(1500, 0))]);
        assert_eq!(plan_withdrawal(&r, true), WithdrawalPlan::AlreadyIssued);
    }

    #[test]
    fn outstanding_heads_become_arrears_summing_to_the_balance() {
        let r = result(vec![
            head("Tuition", Decimal::new(100000, 2)),
            head("Bus Fee", Decimal::new(50000, 2)),
            head("Exam Fee", Decimal::ZERO),
        ]);

        let plan = plan_withdrawal(&r, false);
        let WithdrawalPlan::Blocked {
            total_balance,
            arrears,
        } = &plan
        else {
            panic!("expected a blocked plan, got {:?}", plan);
        };
        assert_eq!(*total_balance, Decimal::new(150000, 2));
        assert_eq!(arrears.len(), 2);
        assert_eq!(plan.shifted(), Decimal::new(150000, 2));
        assert_eq!(arrears[0].account_head, "Tuition A/c");
    }

    #[test]
    fn sub_threshold_heads_are_not_shifted() {
        let r = result(vec![
            head("Tuition", Decimal::new(1000, 0)),
            head("Library Fine", Decimal::new(40, 2)),
        ]);

        let plan = plan_withdrawal(&r, false);
        assert_eq!(plan.shifted(), Decimal::new(1000, 0));
        match plan {
            WithdrawalPlan::Blocked { arrears, .. } => {
                assert_eq!(arrears.len(), 1);
                assert_eq!(arrears[0].fee_head, "Tuition");
            }
            other => panic!("expected a blocked plan, got {:?}", other),
        }
    }

    #[test]
    fn balance_of_exactly_half_stays_behind() {
        let r = result(vec![head("Tuition", MATERIAL_BALANCE)]);
        assert_eq!(plan_withdrawal(&r, false).shifted(), Decimal::ZERO);
    }
}
