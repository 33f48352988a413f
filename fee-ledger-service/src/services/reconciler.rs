//! Balance reconciliation: demand against collections, per head.

use crate::models::{
    AcademicYear, ArrearDirection, ArrearRecord, ArrearSummary, BalanceBucket, DemandMap,
    FeeCategory, HeadBalance, PaymentTransaction, ReconciliationResult, TenantId,
};
use crate::services::database::db_err;
use crate::services::demand::FeeDemandAggregator;
use crate::services::metrics::{RECONCILIATIONS_TOTAL, VIRTUAL_DEMAND_TOTAL};
use crate::services::payment_ledger::load_payments;
use crate::services::registry::TenantConnectionRegistry;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Default)]
struct Collected {
    paid: Decimal,
    concession: Decimal,
    account_head: Option<String>,
}

/// Combine demand and payment rows into per-head balances.
///
/// Heads with payments but no demand get a virtual demand equal to what was
/// collected, so they reconcile to zero. Output is ordered by head name and
/// does not depend on row order.
pub fn reconcile_heads(demand: &DemandMap, payments: &[PaymentTransaction]) -> Vec<HeadBalance> {
    let mut collected: BTreeMap<&str, Collected> = BTreeMap::new();
    for p in payments {
        let entry = collected.entry(p.fee_head.as_str()).or_default();
        entry.paid += p.paid_amount;
        entry.concession += p.concession_amount;
        if entry.account_head.is_none() {
            entry.account_head = Some(p.account_head.clone());
        }
    }

    let mut heads = Vec::with_capacity(demand.len() + collected.len());

    for (fee_head, d) in demand {
        let c = collected.remove(fee_head.as_str()).unwrap_or_default();
        heads.push(head_balance(
            fee_head,
            Some(d.account_head.clone()),
            d.amount,
            c.paid,
            c.concession,
            false,
        ));
    }

    for (fee_head, c) in collected {
        heads.push(head_balance(
            fee_head,
            c.account_head,
            c.paid + c.concession,
            c.paid,
            c.concession,
            true,
        ));
    }

    heads.sort_by(|a, b| a.fee_head.cmp(&b.fee_head));
    heads
}

fn head_balance(
    fee_head: &str,
    account_head: Option<String>,
    demand: Decimal,
    paid: Decimal,
    concession: Decimal,
    virtual_demand: bool,
) -> HeadBalance {
    let balance = (demand - (paid + concession)).max(Decimal::ZERO);
    HeadBalance {
        fee_head: fee_head.to_string(),
        account_head,
        bucket: BalanceBucket::classify(fee_head),
        demand,
        paid,
        concession,
        balance,
        virtual_demand,
    }
}

/// Arrears brought in, collected against, and shifted out.
pub fn summarize_arrears(
    arrears: &[ArrearRecord],
    arrear_payments: &[PaymentTransaction],
) -> ArrearSummary {
    let mut summary = ArrearSummary::default();
    for a in arrears {
        match a.parsed_direction() {
            Some(ArrearDirection::In) => summary.brought_forward += a.amount,
            Some(ArrearDirection::Out) => summary.shifted_out += a.amount,
            None => {}
        }
    }
    summary.collected = arrear_payments.iter().map(|p| p.settled_amount()).sum();
    summary.outstanding = (summary.brought_forward - summary.collected).max(Decimal::ZERO);
    summary
}

/// Assemble the aggregate result; bucket totals are sums of head balances.
pub fn build_result(
    admission_number: &str,
    academic_year: &AcademicYear,
    per_head_balances: Vec<HeadBalance>,
    arrears: ArrearSummary,
) -> ReconciliationResult {
    let mut academic_balance = Decimal::ZERO;
    let mut transport_balance = Decimal::ZERO;
    for head in &per_head_balances {
        match head.bucket {
            BalanceBucket::Academic => academic_balance += head.balance,
            BalanceBucket::Transport => transport_balance += head.balance,
        }
    }

    ReconciliationResult {
        admission_number: admission_number.to_string(),
        academic_year: academic_year.to_string(),
        academic_balance,
        transport_balance,
        total_balance: academic_balance + transport_balance,
        per_head_balances,
        arrears,
    }
}

pub struct BalanceReconciler {
    registry: Arc<TenantConnectionRegistry>,
    demand: Arc<FeeDemandAggregator>,
}

impl BalanceReconciler {
    pub fn new(registry: Arc<TenantConnectionRegistry>, demand: Arc<FeeDemandAggregator>) -> Self {
        Self { registry, demand }
    }

    /// Read-only reconciliation for one student and year.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, academic_year = %academic_year))]
    pub async fn reconcile(
        &self,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<ReconciliationResult, AppError> {
        let pool = self.registry.get_connection(tenant_id).await?;
        let mut conn = pool.acquire().await.map_err(db_err("acquire connection"))?;

        let result = self
            .reconcile_on(&mut conn, tenant_id, admission_number, academic_year)
            .await;

        if let Ok(r) = &result {
            info!(
                total_balance = %r.total_balance,
                heads = r.per_head_balances.len(),
                "Balances reconciled"
            );
        }
        result
    }

    /// Reconcile on a caller-supplied connection, typically inside a write
    /// transaction so the result reflects uncommitted rows.
    pub async fn reconcile_on(
        &self,
        conn: &mut PgConnection,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<ReconciliationResult, AppError> {
        let outcome = self
            .compute(conn, tenant_id, admission_number, academic_year)
            .await;

        let status = if outcome.is_ok() { "ok" } else { "error" };
        RECONCILIATIONS_TOTAL.with_label_values(&[status]).inc();
        outcome
    }

    async fn compute(
        &self,
        conn: &mut PgConnection,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<ReconciliationResult, AppError> {
        let demand = self
            .demand
            .demand_on(conn, tenant_id, admission_number, academic_year)
            .await?;

        let payments = load_payments(conn, admission_number, academic_year).await?;
        let arrears = self
            .demand
            .arrears_on(conn, tenant_id, admission_number, academic_year)
            .await?;

        let arrear_category = FeeCategory::Arrear.as_str();
        let (arrear_payments, primary): (Vec<_>, Vec<_>) = payments
            .into_iter()
            .partition(|p| p.fee_category == arrear_category);

        let heads = reconcile_heads(&demand, &primary);
        for head in heads.iter().filter(|h| h.virtual_demand) {
            let bucket = match head.bucket {
                BalanceBucket::Academic => "academic",
                BalanceBucket::Transport => "transport",
            };
            VIRTUAL_DEMAND_TOTAL.with_label_values(&[bucket]).inc();
            debug!(
                fee_head = %head.fee_head,
                demand = %head.demand,
                "Virtual demand synthesised from payments"
            );
        }

        let summary = summarize_arrears(&arrears, &arrear_payments);
        Ok(build_result(admission_number, academic_year, heads, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Demand;
    use chrono::{NaiveDate, Utc};

    fn demand(entries: &[(&str, i64)]) -> DemandMap {
        entries
            .iter()
            .map(|(head, amount)| {
                (
                    head.to_string(),
                    Demand {
                        amount: Decimal::new(*amount, 0),
                        account_head: format!("{} A/c", head),
                        sources: vec![FeeCategory::Tuition],
                    },
                )
            })
            .collect()
    }

    fn payment(head: &str, paid: i64, concession: i64) -> PaymentTransaction {
        PaymentTransaction {
            payment_id: 1,
            academic_year: "2024-2025".to_string(),
            bill_number: "In0001".to_string(),
            admission_number: "A100".to_string(),
            fee_category: "tuition".to_string(),
            fee_head: head.to_string(),
            account_head: "Misc".to_string(),
            paid_amount: Decimal::new(paid, 0),
            concession_amount: Decimal::new(concession, 0),
            payment_mode: "cash".to_string(),
            paid_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            posting_count: 1,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    fn year() -> AcademicYear {
        AcademicYear::parse("2024-2025").unwrap()
    }

    #[test]
    fn partial_payment_leaves_a_balance() {
        let heads = reconcile_heads(&demand(&[("Tuition", 10000)]), &[payment("Tuition", 6000, 0)]);
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].balance, Decimal::new(4000, 0));
        assert!(!heads[0].is_settled());
    }

    #[test]
    fn overpayment_never_goes_negative() {
        let heads = reconcile_heads(
            &demand(&[("Tuition", 1000)]),
            &[payment("Tuition", 900, 0), payment("Tuition", 300, 50)],
        );
        assert_eq!(heads[0].balance, Decimal::ZERO);
        assert_eq!(heads[0].paid, Decimal::new(1200, 0));
        assert_eq!(heads[0].concession, Decimal::new(50, 0));
    }

    #[test]
    fn payment_without_demand_gets_virtual_demand() {
        let heads = reconcile_heads(&DemandMap::new(), &[payment("Library Fine", 150, 20)]);
        assert_eq!(heads.len(), 1);
        let head = &heads[0];
        assert!(head.virtual_demand);
        assert_eq!(head.demand, Decimal::new(170, 0));
        assert_eq!(head.balance, Decimal::ZERO);
        assert_eq!(head.account_head.as_deref(), Some("Misc"));
    }

    #[test]
    fn unpaid_demand_heads_are_kept() {
        let heads = reconcile_heads(&demand(&[("Exam Fee", 500), ("Tuition", 100)]), &[]);
        assert_eq!(heads.len(), 2);
        assert!(heads.iter().all(|h| !h.virtual_demand));
    }

    #[test]
    fn row_order_does_not_change_the_result() {
        let d = demand(&[("Tuition", 10000), ("Bus Fee", 3000)]);
        let rows = vec![
            payment("Bus Fee", 1000, 0),
            payment("Tuition", 2500, 500),
            payment("Library Fine", 75, 0),
            payment("Tuition", 1000, 0),
        ];
        let mut reversed = rows.clone();
        reversed.reverse();

        assert_eq!(reconcile_heads(&d, &rows), reconcile_heads(&d, &reversed));
    }

    #[test]
    fn buckets_are_summed_from_head_balances() {
        let d = demand(&[("Tuition", 10000), ("Bus Fee", 3000), ("Van Term 2", 500)]);
        let heads = reconcile_heads(&d, &[payment("Bus Fee", 1000, 0)]);
        let result = build_result("A100", &year(), heads, ArrearSummary::default());

        assert_eq!(result.academic_balance, Decimal::new(10000, 0));
        assert_eq!(result.transport_balance, Decimal::new(2500, 0));
        assert_eq!(result.total_balance, Decimal::new(12500, 0));
        assert_eq!(result.head("Bus Fee").unwrap().balance, Decimal::new(2000, 0));
    }

    #[test]
    fn arrear_summary_nets_collections_against_brought_forward() {
        let arrear = |amount: i64, direction: ArrearDirection| ArrearRecord {
            arrear_id: 1,
            tenant_id: "greenwood".to_string(),
            academic_year: "2024-2025".to_string(),
            admission_number: "A100".to_string(),
            fee_head: "Tuition".to_string(),
            account_head: "Tuition".to_string(),
            amount: Decimal::new(amount, 0),
            direction: direction.as_str().to_string(),
            source: "manual".to_string(),
            certificate_id: None,
            created_utc: Utc::now(),
        };
        let mut collected = payment("Old Dues", 300, 0);
        collected.fee_category = "arrear".to_string();

        let summary = summarize_arrears(
            &[arrear(1000, ArrearDirection::In), arrear(250, ArrearDirection::Out)],
            &[collected],
        );
        assert_eq!(summary.brought_forward, Decimal::new(1000, 0));
        assert_eq!(summary.collected, Decimal::new(300, 0));
        assert_eq!(summary.outstanding, Decimal::new(700, 0));
        assert_eq!(summary.shifted_out, Decimal::new(250, 0));
    }
}
