use crate::config::DatabaseConfig;
use crate::models::{
    AcademicYear, ArrearRecord, BillSeries, CertificateIssue, DateRange, DayBookEntry, DemandMap,
    FeeDemandRecord, IssueCertificate, NewArrear, NewFeeDemand, PaymentBill, PaymentCorrection,
    PaymentTransaction, PostPayment, PostedPayment, ReconciliationResult, TenantId,
};
use crate::services::arrear::ArrearCarryForwardService;
use crate::services::database::{db_err, lock_student};
use crate::services::demand::FeeDemandAggregator;
use crate::services::journal::AccountingJournal;
use crate::services::numbering::BillNumberGenerator;
use crate::services::partition::YearPartitionResolver;
use crate::services::payment_ledger::PaymentLedger;
use crate::services::reconciler::BalanceReconciler;
use crate::services::registry::TenantConnectionRegistry;
use crate::services::settlement::{SettlementStatusUpdater, StatusRefresh};
use crate::services::student::{PgStudentDirectory, StudentDirectory};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::info;

/// Entry point for request handlers. Owns the registries and wires the
/// components together.
pub struct FeeLedger {
    registry: Arc<TenantConnectionRegistry>,
    partitions: Arc<YearPartitionResolver>,
    demand: Arc<FeeDemandAggregator>,
    reconciler: Arc<BalanceReconciler>,
    journal: Arc<AccountingJournal>,
    settlement: Arc<SettlementStatusUpdater>,
    payments: PaymentLedger,
    arrears: ArrearCarryForwardService,
    numbering: BillNumberGenerator,
}

impl FeeLedger {
    /// Build with the Postgres-backed student directory.
    pub fn new(settings: DatabaseConfig) -> Result<Self, AppError> {
        let registry = Arc::new(TenantConnectionRegistry::new(settings)?);
        let students = Arc::new(PgStudentDirectory::new(Arc::clone(&registry)));
        Ok(Self::with_students(registry, students))
    }

    pub fn with_students(
        registry: Arc<TenantConnectionRegistry>,
        students: Arc<dyn StudentDirectory>,
    ) -> Self {
        let partitions = Arc::new(YearPartitionResolver::new(Arc::clone(&registry)));
        let demand = Arc::new(FeeDemandAggregator::new(
            Arc::clone(&registry),
            Arc::clone(&partitions),
        ));
        let reconciler = Arc::new(BalanceReconciler::new(
            Arc::clone(&registry),
            Arc::clone(&demand),
        ));
        let journal = Arc::new(AccountingJournal::new(Arc::clone(&registry)));
        let settlement = Arc::new(SettlementStatusUpdater::new(
            Arc::clone(&reconciler),
            Arc::clone(&partitions),
        ));
        let payments = PaymentLedger::new(
            Arc::clone(&registry),
            Arc::clone(&partitions),
            Arc::clone(&journal),
            Arc::clone(&settlement),
        );
        let arrears = ArrearCarryForwardService::new(
            Arc::clone(&registry),
            Arc::clone(&partitions),
            Arc::clone(&reconciler),
            students,
        );
        let numbering = BillNumberGenerator::new(Arc::clone(&registry));

        Self {
            registry,
            partitions,
            demand,
            reconciler,
            journal,
            settlement,
            payments,
            arrears,
            numbering,
        }
    }

    pub fn registry(&self) -> &Arc<TenantConnectionRegistry> {
        &self.registry
    }

    pub fn partitions(&self) -> &Arc<YearPartitionResolver> {
        &self.partitions
    }

    pub async fn reconcile(
        &self,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<ReconciliationResult, AppError> {
        self.reconciler
            .reconcile(tenant_id, admission_number.trim(), academic_year)
            .await
    }

    pub async fn post_payment(
        &self,
        tenant_id: &TenantId,
        payment: PostPayment,
    ) -> Result<PostedPayment, AppError> {
        self.payments.post_payment(tenant_id, payment).await
    }

    pub async fn post_bill(
        &self,
        tenant_id: &TenantId,
        bill: &PaymentBill,
    ) -> Result<Vec<PostedPayment>, AppError> {
        self.payments.post_bill(tenant_id, bill).await
    }

    pub async fn correct_payment(
        &self,
        tenant_id: &TenantId,
        correction: &PaymentCorrection,
    ) -> Result<PostedPayment, AppError> {
        self.payments.correct_payment(tenant_id, correction).await
    }

    /// Recompute and persist the settlement flag of one head outside a
    /// payment, under the same per-student lock the write paths take.
    pub async fn refresh_status(
        &self,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
        fee_head: &str,
    ) -> Result<StatusRefresh, AppError> {
        let admission_number = admission_number.trim();
        let pool = self.registry.get_connection(tenant_id).await?;
        let mut tx = pool.begin().await.map_err(db_err("begin transaction"))?;
        lock_student(&mut tx, tenant_id, academic_year, admission_number).await?;

        let refresh = self
            .settlement
            .refresh_status(
                &mut tx,
                tenant_id,
                admission_number,
                academic_year,
                fee_head.trim(),
            )
            .await?;

        tx.commit().await.map_err(db_err("commit status refresh"))?;
        Ok(refresh)
    }

    pub async fn payments_for(
        &self,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<Vec<PaymentTransaction>, AppError> {
        self.payments
            .payments_for(tenant_id, admission_number.trim(), academic_year)
            .await
    }

    pub async fn issue_certificate(
        &self,
        tenant_id: &TenantId,
        request: &IssueCertificate,
    ) -> Result<CertificateIssue, AppError> {
        self.arrears.issue_certificate(tenant_id, request).await
    }

    pub async fn record_arrear(
        &self,
        tenant_id: &TenantId,
        input: &NewArrear,
    ) -> Result<ArrearRecord, AppError> {
        self.arrears.record_arrear(tenant_id, input).await
    }

    pub async fn get_day_book(
        &self,
        tenant_id: &TenantId,
        range: &DateRange,
    ) -> Result<Vec<DayBookEntry>, AppError> {
        self.journal.day_book(tenant_id, range).await
    }

    pub async fn demand_for(
        &self,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<DemandMap, AppError> {
        self.demand
            .demand_for(tenant_id, admission_number.trim(), academic_year)
            .await
    }

    pub async fn assign_demand(
        &self,
        tenant_id: &TenantId,
        input: &NewFeeDemand,
    ) -> Result<FeeDemandRecord, AppError> {
        self.demand.assign(tenant_id, input).await
    }

    pub async fn next_bill_number(
        &self,
        tenant_id: &TenantId,
        academic_year: &AcademicYear,
        series: BillSeries,
    ) -> Result<String, AppError> {
        self.numbering.next(tenant_id, academic_year, series).await
    }

    /// Close a tenant's pool and forget its ensured partitions.
    pub async fn evict_tenant(&self, tenant_id: &TenantId) -> bool {
        self.partitions.forget_tenant(tenant_id);
        self.registry.evict(tenant_id).await
    }

    pub async fn shutdown(&self) {
        info!(tenants = self.registry.cached_tenants(), "Shutting down fee ledger");
        self.registry.shutdown().await;
    }
}
