//! Fee demand aggregation across the category tables.

use crate::models::{
    AcademicYear, ArrearRecord, Demand, DemandMap, FeeCategory, FeeDemandRecord, NewFeeDemand,
    TenantId,
};
use crate::services::database::{db_err, is_undefined_table};
use crate::services::metrics::{record_error, DB_QUERY_DURATION};
use crate::services::partition::{PartitionTable, YearPartitionResolver};
use crate::services::registry::TenantConnectionRegistry;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{error, info, instrument};
use validator::Validate;

const DEMAND_COLUMNS: &str = "demand_id, tenant_id, academic_year, admission_number, fee_head, \
     account_head, amount, settlement_state, created_utc, updated_utc";

pub(crate) const ARREAR_COLUMNS: &str = "arrear_id, tenant_id, academic_year, admission_number, fee_head, \
     account_head, amount, direction, source, certificate_id, created_utc";

/// Fold demand rows into one entry per fee head.
///
/// The same head may appear in several category tables (e.g. a tuition
/// setup plus an individual top-up); amounts are summed. A negative amount
/// means the setup data is corrupt and is reported, never clamped.
pub fn merge_demand(records: &[(FeeCategory, FeeDemandRecord)]) -> Result<DemandMap, AppError> {
    let mut map = DemandMap::new();

    for (category, record) in records {
        if record.amount < Decimal::ZERO {
            error!(
                admission_number = %record.admission_number,
                fee_head = %record.fee_head,
                amount = %record.amount,
                "Negative demand amount found"
            );
            record_error("integrity_error");
            return Err(AppError::Integrity(anyhow::anyhow!(
                "Negative demand {} for head '{}' in {} fees",
                record.amount,
                record.fee_head,
                category
            )));
        }

        let entry = map.entry(record.fee_head.clone()).or_insert_with(|| Demand {
            amount: Decimal::ZERO,
            account_head: record.account_head.clone(),
            sources: Vec::new(),
        });
        entry.amount += record.amount;
        if !entry.sources.contains(category) {
            entry.sources.push(*category);
        }
    }

    Ok(map)
}

pub struct FeeDemandAggregator {
    registry: Arc<TenantConnectionRegistry>,
    partitions: Arc<YearPartitionResolver>,
}

impl FeeDemandAggregator {
    pub fn new(
        registry: Arc<TenantConnectionRegistry>,
        partitions: Arc<YearPartitionResolver>,
    ) -> Self {
        Self {
            registry,
            partitions,
        }
    }

    /// Per-head demand for a student, excluding arrears.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, academic_year = %academic_year))]
    pub async fn demand_for(
        &self,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<DemandMap, AppError> {
        let pool = self.registry.get_connection(tenant_id).await?;
        let mut conn = pool.acquire().await.map_err(db_err("acquire connection"))?;
        self.demand_on(&mut conn, tenant_id, admission_number, academic_year)
            .await
    }

    pub async fn demand_on(
        &self,
        conn: &mut PgConnection,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<DemandMap, AppError> {
        let records = self
            .demand_records_on(conn, tenant_id, admission_number, academic_year)
            .await?;
        merge_demand(&records)
    }

    /// Raw demand rows in source order: tuition, hostel, transport,
    /// individual. A year that was never used yields no rows.
    pub async fn demand_records_on(
        &self,
        conn: &mut PgConnection,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<Vec<(FeeCategory, FeeDemandRecord)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_demand"])
            .start_timer();

        let mut records = Vec::new();
        for category in FeeCategory::DEMAND_SOURCES {
            let table = self.partitions.resolve(tenant_id, academic_year, category);
            let rows = load_demand_rows(conn, &table, admission_number, academic_year).await?;
            records.extend(rows.into_iter().map(|r| (category, r)));
        }

        timer.observe_duration();
        Ok(records)
    }

    /// Arrear rows for the student in the year, both directions.
    pub async fn arrears_on(
        &self,
        conn: &mut PgConnection,
        tenant_id: &TenantId,
        admission_number: &str,
        academic_year: &AcademicYear,
    ) -> Result<Vec<ArrearRecord>, AppError> {
        let table = self
            .partitions
            .resolve(tenant_id, academic_year, FeeCategory::Arrear);
        let sql = format!(
            "SELECT {} FROM {} WHERE admission_number = $1 AND academic_year = $2 ORDER BY arrear_id",
            ARREAR_COLUMNS,
            table.qualified()
        );

        match sqlx::query_as::<_, ArrearRecord>(&sql)
            .bind(admission_number)
            .bind(academic_year.as_str())
            .fetch_all(&mut *conn)
            .await
        {
            Ok(rows) => Ok(rows),
            Err(e) if is_undefined_table(&e) => Ok(Vec::new()),
            Err(e) => Err(db_err("load arrears")(e)),
        }
    }

    /// Assign a fee to a student. New rows start `pending`.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, fee_head = %input.fee_head))]
    pub async fn assign(
        &self,
        tenant_id: &TenantId,
        input: &NewFeeDemand,
    ) -> Result<FeeDemandRecord, AppError> {
        input.validate()?;
        let academic_year = AcademicYear::parse(&input.academic_year)?;

        if !input.category.is_demand_source() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Arrears are recorded through the arrear service, not as demand"
            )));
        }

        self.partitions
            .ensure_exists(tenant_id, &academic_year)
            .await?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["assign_demand"])
            .start_timer();

        let table = self
            .partitions
            .resolve(tenant_id, &academic_year, input.category);
        let sql = format!(
            r#"
            INSERT INTO {} (tenant_id, academic_year, admission_number, fee_head, account_head, amount)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            table.qualified(),
            DEMAND_COLUMNS
        );

        let pool = self.registry.get_connection(tenant_id).await?;
        let record = sqlx::query_as::<_, FeeDemandRecord>(&sql)
            .bind(tenant_id.as_str())
            .bind(academic_year.as_str())
            .bind(input.admission_number.trim())
            .bind(input.fee_head.trim())
            .bind(input.account_head.trim())
            .bind(input.amount)
            .fetch_one(&pool)
            .await
            .map_err(db_err("assign demand"))?;

        timer.observe_duration();

        info!(
            demand_id = record.demand_id,
            category = %input.category,
            amount = %record.amount,
            "Fee demand assigned"
        );

        Ok(record)
    }
}

async fn load_demand_rows(
    conn: &mut PgConnection,
    table: &PartitionTable,
    admission_number: &str,
    academic_year: &AcademicYear,
) -> Result<Vec<FeeDemandRecord>, AppError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE admission_number = $1 AND academic_year = $2 ORDER BY demand_id",
        DEMAND_COLUMNS,
        table.qualified()
    );

    match sqlx::query_as::<_, FeeDemandRecord>(&sql)
        .bind(admission_number)
        .bind(academic_year.as_str())
        .fetch_all(&mut *conn)
        .await
    {
        Ok(rows) => Ok(rows),
        Err(e) if is_undefined_table(&e) => Ok(Vec::new()),
        Err(e) => Err(db_err("load demand")(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(head: &str, account: &str, amount: i64) -> FeeDemandRecord {
        FeeDemandRecord {
            demand_id: 1,
            tenant_id: "greenwood".to_string(),
            academic_year: "2024-2025".to_string(),
            admission_number: "A100".to_string(),
            fee_head: head.to_string(),
            account_head: account.to_string(),
            amount: Decimal::new(amount, 0),
            settlement_state: "pending".to_string(),
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn same_head_across_sources_is_summed() {
        let records = vec![
            (FeeCategory::Tuition, record("Tuition", "Tuition Fees", 10000)),
            (FeeCategory::Individual, record("Tuition", "Tuition Fees", 500)),
            (FeeCategory::Transport, record("Bus Fee", "Transport", 3000)),
        ];

        let map = merge_demand(&records).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["Tuition"].amount, Decimal::new(10500, 0));
        assert_eq!(
            map["Tuition"].sources,
            vec![FeeCategory::Tuition, FeeCategory::Individual]
        );
        assert_eq!(map["Bus Fee"].account_head, "Transport");
    }

    #[test]
    fn negative_demand_is_an_integrity_error() {
        let records = vec![(FeeCategory::Hostel, record("Hostel", "Hostel", -1))];
        let err = merge_demand(&records).unwrap_err();
        assert!(matches!(err, AppError::Integrity(_)));
    }

    #[test]
    fn zero_demand_rows_still_register_the_head() {
        let records = vec![(FeeCategory::Tuition, record("Exam Fee", "Exams", 0))];
        let map = merge_demand(&records).unwrap();
        assert_eq!(map["Exam Fee"].amount, Decimal::ZERO);
    }
}
