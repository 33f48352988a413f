//! Payment transactions and the inputs that post or correct them.

use crate::models::demand::{FeeCategory, SettlementState};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::models::validation::{money, not_blank};
use std::borrow::Cow;
use validator::{Validate, ValidationError};

/// How money reached the school.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    Cash,
    Cheque,
    Card,
    BankTransfer,
    Online,
    /// Fully conceded line; no money moved.
    Concession,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Cheque => "cheque",
            Self::Card => "card",
            Self::BankTransfer => "bank_transfer",
            Self::Online => "online",
            Self::Concession => "concession",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cash" => Some(Self::Cash),
            "cheque" => Some(Self::Cheque),
            "card" => Some(Self::Card),
            "bank_transfer" => Some(Self::BankTransfer),
            "online" => Some(Self::Online),
            "concession" => Some(Self::Concession),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored payment line. Unique per (academic_year, bill_number, fee_head,
/// admission_number); repeated posts accumulate into the same row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub payment_id: i64,
    pub academic_year: String,
    pub bill_number: String,
    pub admission_number: String,
    pub fee_category: String,
    pub fee_head: String,
    pub account_head: String,
    pub paid_amount: Decimal,
    pub concession_amount: Decimal,
    pub payment_mode: String,
    pub paid_on: NaiveDate,
    pub posting_count: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn settled_amount(&self) -> Decimal {
        self.paid_amount + self.concession_amount
    }
}

fn some_amount_positive(line: &PaymentLine) -> Result<(), ValidationError> {
    if line.paid_amount > Decimal::ZERO || line.concession_amount > Decimal::ZERO {
        return Ok(());
    }
    let mut err = ValidationError::new("zero_amount");
    err.message = Some(Cow::from(
        "at least one of paid amount or concession amount must be positive",
    ));
    Err(err)
}

/// One fee head collected under a bill.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "some_amount_positive"))]
pub struct PaymentLine {
    pub fee_category: FeeCategory,
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
    pub paid_amount: Decimal,
    #[validate(custom(function = "money"))]
    pub concession_amount: Decimal,
}

/// A bill: several lines posted atomically under one bill number.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PaymentBill {
    #[validate(
        length(max = 32),
        custom(function = "not_blank", message = "bill number is required")
    )]
    pub bill_number: String,
    #[validate(
        length(max = 64),
        custom(function = "not_blank", message = "admission number is required")
    )]
    pub admission_number: String,
    pub academic_year: String,
    pub mode: PaymentMode,
    pub paid_on: NaiveDate,
    #[validate(length(min = 1, message = "a bill needs at least one line"))]
    pub lines: Vec<PaymentLine>,
}

/// Single-line payment post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostPayment {
    pub bill_number: String,
    pub admission_number: String,
    pub academic_year: String,
    pub fee_category: FeeCategory,
    pub fee_head: String,
    pub account_head: String,
    pub paid_amount: Decimal,
    pub concession_amount: Decimal,
    pub mode: PaymentMode,
    pub paid_on: NaiveDate,
}

impl From<PostPayment> for PaymentBill {
    fn from(p: PostPayment) -> Self {
        Self {
            bill_number: p.bill_number,
            admission_number: p.admission_number,
            academic_year: p.academic_year,
            mode: p.mode,
            paid_on: p.paid_on,
            lines: vec![PaymentLine {
                fee_category: p.fee_category,
                fee_head: p.fee_head,
                account_head: p.account_head,
                paid_amount: p.paid_amount,
                concession_amount: p.concession_amount,
            }],
        }
    }
}

/// Replacement amounts for an existing payment line.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PaymentCorrection {
    #[validate(
        length(max = 32),
        custom(function = "not_blank", message = "bill number is required")
    )]
    pub bill_number: String,
    #[validate(
        length(max = 64),
        custom(function = "not_blank", message = "admission number is required")
    )]
    pub admission_number: String,
    pub academic_year: String,
    #[validate(
        length(max = 128),
        custom(function = "not_blank", message = "fee head is required")
    )]
    pub fee_head: String,
    #[validate(custom(function = "money"))]
    pub paid_amount: Decimal,
    #[validate(custom(function = "money"))]
    pub concession_amount: Decimal,
    #[validate(
        length(max = 256),
        custom(function = "not_blank", message = "a correction needs a reason")
    )]
    pub reason: String,
}

/// Result of posting one line: the accumulated row and the refreshed status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostedPayment {
    pub transaction: PaymentTransaction,
    pub settlement_state: SettlementState,
    pub head_balance: Decimal,
}

/// Numbering series sharing the 4-digit wrapping counter format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillSeries {
    /// Receipt-style identifiers, prefixed `In`.
    Receipt,
    /// Payment-entry identifiers, bare digits.
    PaymentEntry,
}

impl BillSeries {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receipt => "receipt",
            Self::PaymentEntry => "payment_entry",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Receipt => "In",
            Self::PaymentEntry => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(paid: i64, concession: i64) -> PaymentLine {
        PaymentLine {
            fee_category: FeeCategory::Tuition,
            fee_head: "Tuition Term 1".to_string(),
            account_head: "Tuition Fees".to_string(),
            paid_amount: Decimal::new(paid, 0),
            concession_amount: Decimal::new(concession, 0),
        }
    }

    #[test]
    fn line_needs_a_positive_amount() {
        assert!(line(0, 0).validate().is_err());
        assert!(line(50, 0).validate().is_ok());
        assert!(line(0, 25).validate().is_ok());
    }

    #[test]
    fn line_rejects_negative_amounts() {
        assert!(line(-10, 20).validate().is_err());
    }

    #[test]
    fn line_rejects_empty_heads() {
        let mut l = line(10, 0);
        l.fee_head = String::new();
        assert!(l.validate().is_err());

        let mut l = line(10, 0);
        l.account_head = String::new();
        assert!(l.validate().is_err());
    }

    #[test]
    fn whitespace_only_heads_are_empty() {
        let mut l = line(10, 0);
        l.fee_head = "   ".to_string();
        assert!(l.validate().is_err());

        let mut l = line(10, 0);
        l.account_head = "\t".to_string();
        assert!(l.validate().is_err());
    }

    #[test]
    fn sub_paisa_amount_is_not_a_positive_amount() {
        let mut l = line(0, 0);
        l.paid_amount = Decimal::new(4, 3);
        assert!(l.validate().is_err());

        l.paid_amount = Decimal::new(1, 2);
        assert!(l.validate().is_ok());
    }

    #[test]
    fn amount_beyond_column_range_is_invalid() {
        let mut l = line(0, 0);
        l.paid_amount = Decimal::new(1_000_000_000_000, 0);
        assert!(l.validate().is_err());
    }

    #[test]
    fn bill_without_lines_is_invalid() {
        let bill = PaymentBill {
            bill_number: "In0001".to_string(),
            admission_number: "A100".to_string(),
            academic_year: "2024-2025".to_string(),
            mode: PaymentMode::Cash,
            paid_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            lines: vec![],
        };
        assert!(bill.validate().is_err());
    }

    #[test]
    fn blank_bill_and_admission_numbers_are_invalid() {
        let mut bill: PaymentBill = PostPayment {
            bill_number: " ".to_string(),
            admission_number: "A100".to_string(),
            academic_year: "2024-2025".to_string(),
            fee_category: FeeCategory::Tuition,
            fee_head: "Tuition".to_string(),
            account_head: "Tuition Fees".to_string(),
            paid_amount: Decimal::new(10, 0),
            concession_amount: Decimal::ZERO,
            mode: PaymentMode::Cash,
            paid_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        }
        .into();
        assert!(bill.validate().is_err());

        bill.bill_number = "In0001".to_string();
        bill.admission_number = "\n ".to_string();
        assert!(bill.validate().is_err());

        bill.admission_number = "A100".to_string();
        assert!(bill.validate().is_ok());
    }
}
