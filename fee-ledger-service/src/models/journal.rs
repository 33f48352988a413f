//! Day book entries: the chronological credit/debit journal.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::borrow::Cow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Stored day book row.
///
/// `credit` holds money received, `debit` money disbursed or conceded.
/// Rows are only rewritten when their parent payment line is corrected; no
/// compensating entries are created. This is not double-entry bookkeeping.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DayBookEntry {
    pub entry_id: Uuid,
    pub academic_year: String,
    pub reference_number: String,
    pub student_ref: String,
    pub entry_date: NaiveDate,
    pub ledger_head: String,
    pub fee_head: String,
    pub credit: Decimal,
    pub debit: Decimal,
    pub mode: String,
    /// Insertion order; ties on date are broken by this.
    pub entry_seq: i64,
    pub created_utc: DateTime<Utc>,
    pub restated_utc: Option<DateTime<Utc>>,
}

impl DayBookEntry {
    /// Net effect on the school's cash position.
    pub fn net(&self) -> Decimal {
        self.credit - self.debit
    }
}

/// Input for appending one day book row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDayBookEntry {
    pub academic_year: String,
    pub reference_number: String,
    pub student_ref: String,
    pub entry_date: NaiveDate,
    pub ledger_head: String,
    pub fee_head: String,
    pub credit: Decimal,
    pub debit: Decimal,
    pub mode: String,
}

fn ordered_range(range: &DateRange) -> Result<(), ValidationError> {
    if range.from > range.to {
        let mut err = ValidationError::new("inverted_range");
        err.message = Some(Cow::from("start date must not be after end date"));
        return Err(err);
    }
    Ok(())
}

/// Inclusive date range for day book queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[validate(schema(function = "ordered_range"))]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}
