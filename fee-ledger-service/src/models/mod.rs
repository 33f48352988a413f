//! Domain models for fee-ledger-service.

#![allow(clippy::should_implement_trait)]

mod arrear;
mod demand;
mod journal;
mod payment;
mod reconciliation;
mod tenant;
mod validation;

pub use arrear::{
    ArrearDirection, ArrearRecord, ArrearSource, CertificateIssue, IssueCertificate, NewArrear,
    PlannedArrear, TransferCertificate,
};
pub use demand::{Demand, DemandMap, FeeCategory, FeeDemandRecord, NewFeeDemand, SettlementState};
pub use journal::{DateRange, DayBookEntry, NewDayBookEntry};
pub use payment::{
    BillSeries, PaymentBill, PaymentCorrection, PaymentLine, PaymentMode, PaymentTransaction,
    PostPayment, PostedPayment,
};
pub use reconciliation::{
    ArrearSummary, BalanceBucket, HeadBalance, ReconciliationResult, Student, MATERIAL_BALANCE,
    SETTLED_EPSILON,
};
pub use tenant::{AcademicYear, TenantId};
pub use validation::MAX_AMOUNT;
