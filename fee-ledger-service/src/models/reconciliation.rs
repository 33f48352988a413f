//! Derived balances. Nothing here is stored.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balances at or below this are treated as settled (0.01).
pub const SETTLED_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Head balances above this are carried forward as arrears (0.50).
pub const MATERIAL_BALANCE: Decimal = Decimal::from_parts(50, 0, 0, false, 2);

const TRANSPORT_TOKENS: [&str; 3] = ["transport", "bus", "van"];

/// Reporting bucket for a fee head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceBucket {
    Academic,
    Transport,
}

impl BalanceBucket {
    /// Case-insensitive substring match on the head name.
    pub fn classify(fee_head: &str) -> Self {
        let lowered = fee_head.to_lowercase();
        if TRANSPORT_TOKENS.iter().any(|t| lowered.contains(t)) {
            Self::Transport
        } else {
            Self::Academic
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadBalance {
    pub fee_head: String,
    pub account_head: Option<String>,
    pub bucket: BalanceBucket,
    pub demand: Decimal,
    pub paid: Decimal,
    pub concession: Decimal,
    pub balance: Decimal,
    /// Demand was inferred from payments because no demand row exists.
    pub virtual_demand: bool,
}

impl HeadBalance {
    pub fn is_settled(&self) -> bool {
        self.balance <= SETTLED_EPSILON
    }
}

/// Arrears are reported next to the primary balances, never inside them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrearSummary {
    pub brought_forward: Decimal,
    pub collected: Decimal,
    pub outstanding: Decimal,
    pub shifted_out: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub admission_number: String,
    pub academic_year: String,
    pub academic_balance: Decimal,
    pub transport_balance: Decimal,
    pub total_balance: Decimal,
    pub per_head_balances: Vec<HeadBalance>,
    pub arrears: ArrearSummary,
}

impl ReconciliationResult {
    pub fn head(&self, fee_head: &str) -> Option<&HeadBalance> {
        self.per_head_balances.iter().find(|h| h.fee_head == fee_head)
    }

    pub fn is_settled(&self) -> bool {
        self.total_balance <= SETTLED_EPSILON
    }
}

/// Upstream identity record for a student.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Student {
    pub admission_number: String,
    pub full_name: String,
    pub standard: String,
    pub section: Option<String>,
}
