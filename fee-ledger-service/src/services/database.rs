//! Shared database plumbing: error classification, identifier quoting and
//! per-student locking.

use crate::models::{AcademicYear, TenantId};
use crate::services::metrics::record_error;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::warn;

const UNDEFINED_TABLE: &str = "42P01";
const DUPLICATE_TABLE: &str = "42P07";
const DUPLICATE_SCHEMA: &str = "42P06";
const DUPLICATE_OBJECT: &str = "42710";
const UNIQUE_VIOLATION: &str = "23505";
const NUMERIC_OUT_OF_RANGE: &str = "22003";
const QUERY_CANCELED: &str = "57014";
const ADMIN_SHUTDOWN: &str = "57P01";
const CANNOT_CONNECT_NOW: &str = "57P03";

fn sqlstate(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Map a sqlx error onto the service taxonomy.
///
/// Timeouts and lost connections become retryable `Connectivity` errors with
/// the driver detail kept out of the message.
pub fn classify(operation: &'static str, e: sqlx::Error) -> AppError {
    let err = match &e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => {
            warn!(operation, error = %e, "Database unavailable");
            AppError::Connectivity(anyhow::anyhow!(
                "Database unavailable during {}",
                operation
            ))
        }
        _ => match sqlstate(&e).as_deref() {
            Some(QUERY_CANCELED) | Some(ADMIN_SHUTDOWN) | Some(CANNOT_CONNECT_NOW) => {
                warn!(operation, error = %e, "Database statement timed out or was cancelled");
                AppError::Connectivity(anyhow::anyhow!(
                    "Database timed out during {}",
                    operation
                ))
            }
            Some(NUMERIC_OUT_OF_RANGE) => {
                warn!(operation, error = %e, "Accumulated amount exceeds column range");
                AppError::BadRequest(anyhow::anyhow!(
                    "Amount out of range during {}",
                    operation
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", operation, e)),
        },
    };
    record_error(err.kind());
    err
}

/// Closure form of [`classify`] for `map_err`.
pub fn db_err(operation: &'static str) -> impl Fn(sqlx::Error) -> AppError {
    move |e| classify(operation, e)
}

pub fn is_undefined_table(e: &sqlx::Error) -> bool {
    sqlstate(e).as_deref() == Some(UNDEFINED_TABLE)
}

pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    sqlstate(e).as_deref() == Some(UNIQUE_VIOLATION)
}

/// Errors raised when two sessions race on the same `IF NOT EXISTS` DDL.
/// The loser sees a duplicate error even though the object now exists.
pub fn is_duplicate_ddl(e: &sqlx::Error) -> bool {
    matches!(
        sqlstate(e).as_deref(),
        Some(DUPLICATE_TABLE) | Some(DUPLICATE_SCHEMA) | Some(DUPLICATE_OBJECT) | Some(UNIQUE_VIOLATION)
    )
}

/// Double-quote an identifier. Callers only pass names derived from
/// validated tenant ids and academic years.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Serialise write cycles for one student within one year.
///
/// Transaction-scoped advisory lock; released on commit or rollback.
pub async fn lock_student(
    conn: &mut PgConnection,
    tenant_id: &TenantId,
    academic_year: &AcademicYear,
    admission_number: &str,
) -> Result<(), AppError> {
    let key = format!("{}:{}:{}", tenant_id, academic_year, admission_number);
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(&key)
        .execute(&mut *conn)
        .await
        .map_err(db_err("lock student"))?;
    Ok(())
}

/// Check connectivity with a trivial round trip.
pub async fn ping(conn: &mut PgConnection) -> Result<(), AppError> {
    sqlx::query("SELECT 1")
        .execute(&mut *conn)
        .await
        .map_err(db_err("health check"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_connectivity_errors() {
        let err = classify("post payment", sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert!(!err.to_string().contains("postgres://"));
    }

    #[test]
    fn row_not_found_is_a_plain_database_error() {
        let err = classify("load payment", sqlx::Error::RowNotFound);
        assert!(matches!(err, AppError::DatabaseError(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("school_a"), "\"school_a\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
