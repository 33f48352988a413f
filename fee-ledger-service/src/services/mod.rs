pub mod arrear;
pub mod database;
pub mod demand;
pub mod fee_ledger;
pub mod journal;
pub mod metrics;
pub mod numbering;
pub mod partition;
pub mod payment_ledger;
pub mod reconciler;
pub mod registry;
pub mod settlement;
pub mod student;

pub use arrear::{plan_withdrawal, ArrearCarryForwardService, WithdrawalPlan};
pub use demand::{merge_demand, FeeDemandAggregator};
pub use fee_ledger::FeeLedger;
pub use journal::AccountingJournal;
pub use numbering::{format_bill_number, next_counter, BillNumberGenerator};
pub use partition::{table_name, PartitionTable, YearPartitionResolver};
pub use payment_ledger::PaymentLedger;
pub use reconciler::{reconcile_heads, BalanceReconciler};
pub use registry::TenantConnectionRegistry;
pub use settlement::{settlement_for, SettlementStatusUpdater, StatusRefresh};
pub use student::{PgStudentDirectory, StudentDirectory};
