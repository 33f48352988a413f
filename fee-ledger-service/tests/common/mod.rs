//! Common test utilities for fee-ledger-service integration tests.
//!
//! Database tests need `TEST_DATABASE_URL` pointing at a Postgres instance.

#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, Utc};
use fee_ledger_service::config::DatabaseConfig;
use fee_ledger_service::models::{
    AcademicYear, FeeCategory, NewFeeDemand, PaymentMode, PostPayment, PostedPayment, Student,
    TenantId,
};
use fee_ledger_service::services::{FeeLedger, PgStudentDirectory};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

pub const YEAR: &str = "2024-2025";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,fee_ledger_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn database_config(url: String) -> DatabaseConfig {
    DatabaseConfig {
        url,
        tenant_max_connections: 3,
        tenant_idle_timeout_secs: 30,
        acquire_timeout_secs: 5,
        statement_timeout_ms: 10_000,
        schema_prefix: "test_school_".to_string(),
        run_migrations: true,
    }
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// One ledger bound to a fresh tenant schema.
pub struct TestLedger {
    pub ledger: Arc<FeeLedger>,
    pub students: PgStudentDirectory,
    pub tenant: TenantId,
    pub year: AcademicYear,
}

/// Build a ledger against `TEST_DATABASE_URL` with a tenant no other test
/// uses.
pub async fn spawn_ledger() -> TestLedger {
    init_tracing();

    let url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set - point it at a Postgres database to run tests");

    let ledger = Arc::new(FeeLedger::new(database_config(url)).expect("Failed to build ledger"));
    let students = PgStudentDirectory::new(Arc::clone(ledger.registry()));
    let tenant = TenantId::parse(&format!("t_{}", Uuid::new_v4().simple())).unwrap();

    TestLedger {
        ledger,
        students,
        tenant,
        year: AcademicYear::parse(YEAR).unwrap(),
    }
}

impl TestLedger {
    pub async fn admit(&self, admission_number: &str) {
        self.students
            .register(
                &self.tenant,
                &Student {
                    admission_number: admission_number.to_string(),
                    full_name: format!("Student {}", admission_number),
                    standard: "VII".to_string(),
                    section: Some("B".to_string()),
                },
            )
            .await
            .expect("Failed to register student");
    }

    pub async fn assign(
        &self,
        admission_number: &str,
        category: FeeCategory,
        fee_head: &str,
        amount: &str,
    ) {
        self.ledger
            .assign_demand(
                &self.tenant,
                &NewFeeDemand {
                    admission_number: admission_number.to_string(),
                    academic_year: YEAR.to_string(),
                    category,
                    fee_head: fee_head.to_string(),
                    account_head: format!("{} A/c", fee_head),
                    amount: dec(amount),
                },
            )
            .await
            .expect("Failed to assign demand");
    }

    pub fn payment(
        &self,
        bill_number: &str,
        admission_number: &str,
        fee_head: &str,
        paid: &str,
        concession: &str,
    ) -> PostPayment {
        PostPayment {
            bill_number: bill_number.to_string(),
            admission_number: admission_number.to_string(),
            academic_year: YEAR.to_string(),
            fee_category: FeeCategory::Tuition,
            fee_head: fee_head.to_string(),
            account_head: format!("{} A/c", fee_head),
            paid_amount: dec(paid),
            concession_amount: dec(concession),
            mode: PaymentMode::Cash,
            paid_on: date(2024, 6, 15),
        }
    }

    pub async fn pay(
        &self,
        bill_number: &str,
        admission_number: &str,
        fee_head: &str,
        paid: &str,
        concession: &str,
    ) -> PostedPayment {
        self.ledger
            .post_payment(
                &self.tenant,
                self.payment(bill_number, admission_number, fee_head, paid, concession),
            )
            .await
            .expect("Failed to post payment")
    }

    /// Demand row states for a head, straight from the year table.
    pub async fn stored_states(&self, category: FeeCategory, fee_head: &str) -> Vec<String> {
        let pool = self.ledger.registry().get_connection(&self.tenant).await.unwrap();
        let table = self
            .ledger
            .partitions()
            .resolve(&self.tenant, &self.year, category);
        sqlx::query_scalar(&format!(
            "SELECT settlement_state FROM {} WHERE fee_head = $1 ORDER BY demand_id",
            table.qualified()
        ))
        .bind(fee_head)
        .fetch_all(&pool)
        .await
        .unwrap()
    }

    /// Last write time of each demand row for a head.
    pub async fn stored_updates(
        &self,
        category: FeeCategory,
        fee_head: &str,
    ) -> Vec<DateTime<Utc>> {
        let pool = self.ledger.registry().get_connection(&self.tenant).await.unwrap();
        let table = self
            .ledger
            .partitions()
            .resolve(&self.tenant, &self.year, category);
        sqlx::query_scalar(&format!(
            "SELECT updated_utc FROM {} WHERE fee_head = $1 ORDER BY demand_id",
            table.qualified()
        ))
        .bind(fee_head)
        .fetch_all(&pool)
        .await
        .unwrap()
    }

    /// Drop the tenant schema and close its pool.
    pub async fn cleanup(self) {
        let schema = self.ledger.registry().schema_for(&self.tenant);
        if let Ok(pool) = self.ledger.registry().get_connection(&self.tenant).await {
            sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", schema))
                .execute(&pool)
                .await
                .ok();
        }
        self.ledger.evict_tenant(&self.tenant).await;
    }
}
