//! Fee demand model: what a student owes per fee head.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use crate::models::validation::{money, not_blank};
use validator::Validate;

/// Category of a fee source. Each category is stored in its own
/// year-partitioned table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeCategory {
    Tuition,
    Hostel,
    Transport,
    Individual,
    Arrear,
}

impl FeeCategory {
    /// Categories whose rows make up the primary demand map. Arrears are
    /// tracked separately so they are never subtracted twice.
    pub const DEMAND_SOURCES: [FeeCategory; 4] = [
        FeeCategory::Tuition,
        FeeCategory::Hostel,
        FeeCategory::Transport,
        FeeCategory::Individual,
    ];

    pub const ALL: [FeeCategory; 5] = [
        FeeCategory::Tuition,
        FeeCategory::Hostel,
        FeeCategory::Transport,
        FeeCategory::Individual,
        FeeCategory::Arrear,
    ];

    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tuition => "tuition",
            Self::Hostel => "hostel",
            Self::Transport => "transport",
            Self::Individual => "individual",
            Self::Arrear => "arrear",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "tuition" => Some(Self::Tuition),
            "hostel" => Some(Self::Hostel),
            "transport" => Some(Self::Transport),
            "individual" => Some(Self::Individual),
            "arrear" => Some(Self::Arrear),
            _ => None,
        }
    }

    /// Table name prefix; the partition suffix is appended by the resolver.
    pub fn table_prefix(&self) -> &'static str {
        match self {
            Self::Tuition => "tuition_fees",
            Self::Hostel => "hostel_fees",
            Self::Transport => "transport_fees",
            Self::Individual => "individual_fees",
            Self::Arrear => "arrear_fees",
        }
    }

    pub fn is_demand_source(&self) -> bool {
        !matches!(self, Self::Arrear)
    }
}

impl std::fmt::Display for FeeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Derived settlement flag stored next to each demand row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementState {
    Pending,
    Settled,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Settled => "settled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "settled" => Some(Self::Settled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SettlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One demand row. `amount` never changes after insert.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FeeDemandRecord {
    pub demand_id: i64,
    pub tenant_id: String,
    pub academic_year: String,
    pub admission_number: String,
    pub fee_head: String,
    pub account_head: String,
    pub amount: Decimal,
    pub settlement_state: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl FeeDemandRecord {
    pub fn parsed_state(&self) -> Option<SettlementState> {
        SettlementState::from_str(&self.settlement_state)
    }
}

/// Input for assigning a fee to a student.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewFeeDemand {
    #[validate(
        length(max = 64),
        custom(function = "not_blank", message = "admission number is required")
    )]
    pub admission_number: String,
    pub academic_year: String,
    pub category: FeeCategory,
    #[validate(
        length(max = 128),
        custom(function = "not_blank", message = "fee head is required")
    )]
    pub fee_head: String,
    #[validate(
        length(max = 128),
        custom(function = "not_blank", message = "account head is required")
    )]
    pub account_head: String,
    #[validate(custom(function = "money"))]
    pub amount: Decimal,
}

/// Aggregated demand for one fee head across every demand source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demand {
    pub amount: Decimal,
    pub account_head: String,
    pub sources: Vec<FeeCategory>,
}

/// Per-head demand, ordered by head name so iteration is deterministic.
pub type DemandMap = BTreeMap<String, Demand>;
