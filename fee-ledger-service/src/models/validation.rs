//! Field validators shared by the input models.
//!
//! Identifiers and heads are stored trimmed, so blankness is judged after
//! trimming. Money columns are `NUMERIC(14,2)`: anything finer than a paisa
//! or wider than twelve integer digits is rejected here rather than rounded
//! or overflowed by the database.

use rust_decimal::Decimal;
use std::borrow::Cow;
use validator::ValidationError;

/// Largest value a `NUMERIC(14,2)` column holds.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(276_447_231, 23_283, 0, false, 2);

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::from(message));
    err
}

pub(crate) fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(invalid("blank", "value must not be blank"));
    }
    Ok(())
}

pub(crate) fn money(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        return Err(invalid("negative_amount", "amount must not be negative"));
    }
    if value.normalize().scale() > 2 {
        return Err(invalid(
            "amount_precision",
            "amount must have at most two decimal places",
        ));
    }
    if *value > MAX_AMOUNT {
        return Err(invalid("amount_range", "amount is too large"));
    }
    Ok(())
}

pub(crate) fn positive_money(value: &Decimal) -> Result<(), ValidationError> {
    money(value)?;
    if value.is_zero() {
        return Err(invalid("zero_amount", "amount must be positive"));
    }
    Ok(())
}
