//! Prometheus metrics for fee-ledger-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge, TextEncoder,
};

/// Payment lines posted, by outcome.
pub static PAYMENTS_POSTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_payments_posted_total",
        "Total number of payment lines posted",
        &["status"] // ok, error - never tenant or student ids
    )
    .expect("Failed to register payments_posted_total")
});

pub static RECONCILIATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_reconciliations_total",
        "Total number of balance reconciliations",
        &["status"]
    )
    .expect("Failed to register reconciliations_total")
});

/// Heads whose demand was synthesised from payments.
pub static VIRTUAL_DEMAND_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_virtual_demand_heads_total",
        "Fee heads reconciled without a demand row",
        &["bucket"]
    )
    .expect("Failed to register virtual_demand_heads_total")
});

/// Settlement status writes: written vs skipped because unchanged.
pub static STATUS_WRITES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_status_writes_total",
        "Settlement status refreshes by outcome",
        &["outcome"]
    )
    .expect("Failed to register status_writes_total")
});

pub static ARREARS_CREATED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_arrears_created_total",
        "Arrear records created",
        &["source"]
    )
    .expect("Failed to register arrears_created_total")
});

pub static CERTIFICATES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_certificates_total",
        "Transfer certificate requests by outcome",
        &["outcome"] // eligible, forced, blocked, already_issued
    )
    .expect("Failed to register certificates_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fee_ledger_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

pub static TENANT_POOLS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "fee_ledger_tenant_pools",
        "Number of cached per-tenant connection pools"
    )
    .expect("Failed to register tenant_pools")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&PAYMENTS_POSTED_TOTAL);
    Lazy::force(&RECONCILIATIONS_TOTAL);
    Lazy::force(&VIRTUAL_DEMAND_TOTAL);
    Lazy::force(&STATUS_WRITES_TOTAL);
    Lazy::force(&ARREARS_CREATED_TOTAL);
    Lazy::force(&CERTIFICATES_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&TENANT_POOLS);
}

pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
