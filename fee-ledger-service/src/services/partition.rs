//! Year-partitioned demand tables.
//!
//! Demand rows live in one table per (category, academic year), named
//! `{category}_{year}` inside the tenant's schema, e.g.
//! `tuition_fees_2024_2025`. Every table also carries `tenant_id` and
//! `academic_year` columns so rows remain self-describing.

use crate::models::{AcademicYear, FeeCategory, TenantId};
use crate::services::database::{classify, is_duplicate_ddl, quote_ident};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::registry::TenantConnectionRegistry;
use dashmap::DashSet;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A resolved partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub schema: String,
    pub table: String,
}

impl PartitionTable {
    /// Schema-qualified, quoted name for SQL text.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    fn index_name(&self, suffix: &str) -> String {
        quote_ident(&format!("{}_{}", self.table, suffix))
    }
}

/// Table name for a category and year, without schema.
pub fn table_name(category: FeeCategory, academic_year: &AcademicYear) -> String {
    format!("{}_{}", category.table_prefix(), academic_year.table_suffix())
}

fn demand_table_ddl(t: &PartitionTable) -> Vec<String> {
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                demand_id        BIGSERIAL PRIMARY KEY,
                tenant_id        VARCHAR(64)   NOT NULL,
                academic_year    VARCHAR(32)   NOT NULL,
                admission_number VARCHAR(64)   NOT NULL,
                fee_head         VARCHAR(128)  NOT NULL,
                account_head     VARCHAR(128)  NOT NULL,
                amount           NUMERIC(14,2) NOT NULL CHECK (amount >= 0),
                settlement_state VARCHAR(16)   NOT NULL DEFAULT 'pending'
                    CHECK (settlement_state IN ('pending', 'settled')),
                created_utc      TIMESTAMPTZ   NOT NULL DEFAULT now(),
                updated_utc      TIMESTAMPTZ   NOT NULL DEFAULT now()
            )
            "#,
            table = t.qualified()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (admission_number)",
            t.index_name("admission_idx"),
            t.qualified()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (tenant_id, academic_year)",
            t.index_name("tenant_year_idx"),
            t.qualified()
        ),
    ]
}

fn arrear_table_ddl(t: &PartitionTable) -> Vec<String> {
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                arrear_id        BIGSERIAL PRIMARY KEY,
                tenant_id        VARCHAR(64)   NOT NULL,
                academic_year    VARCHAR(32)   NOT NULL,
                admission_number VARCHAR(64)   NOT NULL,
                fee_head         VARCHAR(128)  NOT NULL,
                account_head     VARCHAR(128)  NOT NULL,
                amount           NUMERIC(14,2) NOT NULL CHECK (amount > 0),
                direction        VARCHAR(3)    NOT NULL CHECK (direction IN ('IN', 'OUT')),
                source           VARCHAR(16)   NOT NULL CHECK (source IN ('manual', 'withdrawal')),
                certificate_id   UUID,
                created_utc      TIMESTAMPTZ   NOT NULL DEFAULT now()
            )
            "#,
            table = t.qualified()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (admission_number)",
            t.index_name("admission_idx"),
            t.qualified()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (tenant_id, academic_year)",
            t.index_name("tenant_year_idx"),
            t.qualified()
        ),
    ]
}

pub struct YearPartitionResolver {
    registry: Arc<TenantConnectionRegistry>,
    ensured: DashSet<(TenantId, String)>,
}

impl YearPartitionResolver {
    pub fn new(registry: Arc<TenantConnectionRegistry>) -> Self {
        Self {
            registry,
            ensured: DashSet::new(),
        }
    }

    pub fn resolve(
        &self,
        tenant_id: &TenantId,
        academic_year: &AcademicYear,
        category: FeeCategory,
    ) -> PartitionTable {
        PartitionTable {
            schema: self.registry.schema_for(tenant_id),
            table: table_name(category, academic_year),
        }
    }

    pub fn is_ensured(&self, tenant_id: &TenantId, academic_year: &AcademicYear) -> bool {
        self.ensured
            .contains(&(tenant_id.clone(), academic_year.table_suffix()))
    }

    /// Create every category table for the year if absent.
    ///
    /// Cached per (tenant, year) after the first success. Safe to race: the
    /// loser of a concurrent `IF NOT EXISTS` sees a duplicate error, which is
    /// treated as success.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, academic_year = %academic_year))]
    pub async fn ensure_exists(
        &self,
        tenant_id: &TenantId,
        academic_year: &AcademicYear,
    ) -> Result<(), AppError> {
        if self.is_ensured(tenant_id, academic_year) {
            return Ok(());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["ensure_partitions"])
            .start_timer();

        let pool = self.registry.get_connection(tenant_id).await?;

        for category in FeeCategory::ALL {
            let table = self.resolve(tenant_id, academic_year, category);
            let statements = if category.is_demand_source() {
                demand_table_ddl(&table)
            } else {
                arrear_table_ddl(&table)
            };

            for ddl in statements {
                match sqlx::query(&ddl).execute(&pool).await {
                    Ok(_) => {}
                    Err(e) if is_duplicate_ddl(&e) => {
                        debug!(table = %table.table, "Partition created concurrently");
                    }
                    Err(e) => return Err(classify("ensure partition table", e)),
                }
            }
        }

        timer.observe_duration();
        self.ensured
            .insert((tenant_id.clone(), academic_year.table_suffix()));

        info!("Year partition tables ensured");
        Ok(())
    }

    /// Forget cached markers for a tenant, e.g. after its pool is evicted.
    pub fn forget_tenant(&self, tenant_id: &TenantId) {
        self.ensured.retain(|(tenant, _)| tenant != tenant_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_follow_category_and_sanitised_year() {
        let year = AcademicYear::parse("2024-2025").unwrap();
        assert_eq!(table_name(FeeCategory::Tuition, &year), "tuition_fees_2024_2025");
        assert_eq!(table_name(FeeCategory::Hostel, &year), "hostel_fees_2024_2025");
        assert_eq!(table_name(FeeCategory::Transport, &year), "transport_fees_2024_2025");
        assert_eq!(table_name(FeeCategory::Individual, &year), "individual_fees_2024_2025");
        assert_eq!(table_name(FeeCategory::Arrear, &year), "arrear_fees_2024_2025");
    }

    #[test]
    fn qualified_name_quotes_schema_and_table() {
        let t = PartitionTable {
            schema: "school_greenwood".to_string(),
            table: "tuition_fees_2024_2025".to_string(),
        };
        assert_eq!(t.qualified(), "\"school_greenwood\".\"tuition_fees_2024_2025\"");
    }

    #[test]
    fn every_partition_gets_admission_and_tenant_year_indexes() {
        let t = PartitionTable {
            schema: "school_a".to_string(),
            table: "hostel_fees_2024_2025".to_string(),
        };
        let ddl = demand_table_ddl(&t).join("\n");
        assert!(ddl.contains("hostel_fees_2024_2025_admission_idx"));
        assert!(ddl.contains("(tenant_id, academic_year)"));
        assert!(ddl.contains("IF NOT EXISTS"));
    }
}
