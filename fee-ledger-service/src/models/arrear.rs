//! Arrears and transfer certificates.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use crate::models::validation::{not_blank, positive_money};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArrearDirection {
    /// Due brought into the year (operator entry).
    In,
    /// Balance shifted out of the year at withdrawal.
    Out,
}

impl ArrearDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::Out => "OUT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IN" => Some(Self::In),
            "OUT" => Some(Self::Out),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArrearDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an arrear came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrearSource {
    Manual,
    Withdrawal,
}

impl ArrearSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Withdrawal => "withdrawal",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ArrearRecord {
    pub arrear_id: i64,
    pub tenant_id: String,
    pub academic_year: String,
    pub admission_number: String,
    pub fee_head: String,
    pub account_head: String,
    pub amount: Decimal,
    pub direction: String,
    pub source: String,
    pub certificate_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl ArrearRecord {
    pub fn parsed_direction(&self) -> Option<ArrearDirection> {
        ArrearDirection::from_str(&self.direction)
    }
}

/// Operator-entered off-cycle due.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewArrear {
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
    #[validate(
        length(max = 128),
        custom(function = "not_blank", message = "account head is required")
    )]
    pub account_head: String,
    #[validate(custom(function = "positive_money"))]
    pub amount: Decimal,
}

/// Arrear planned for one outstanding head at withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedArrear {
    pub fee_head: String,
    pub account_head: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransferCertificate {
    pub certificate_id: Uuid,
    pub academic_year: String,
    pub admission_number: String,
    pub fee_balance_shifted: Decimal,
    pub issued_on: NaiveDate,
    pub created_utc: DateTime<Utc>,
}

/// Request to withdraw a student and issue the certificate.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IssueCertificate {
    #[validate(
        length(max = 64),
        custom(function = "not_blank", message = "admission number is required")
    )]
    pub admission_number: String,
    pub academic_year: String,
    pub issued_on: NaiveDate,
    /// Shift any outstanding balance into arrears instead of refusing.
    pub force: bool,
}

/// Outcome of a successful issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateIssue {
    pub certificate: TransferCertificate,
    pub arrears: Vec<ArrearRecord>,
}
