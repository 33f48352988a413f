//! Tenant and academic-year identifiers.

use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::fmt;

const MAX_TENANT_ID_LEN: usize = 40;
// Keeps derived index names under the 63-byte identifier limit.
const MAX_ACADEMIC_YEAR_LEN: usize = 20;

/// Opaque school identifier.
///
/// Normalised to lowercase so that `ABC` and `abc` address the same schema.
/// Only ASCII letters, digits and `_` are accepted; anything else would make
/// the derived schema name ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Tenant id must not be empty"
            )));
        }
        if trimmed.len() > MAX_TENANT_ID_LEN {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Tenant id must be at most {} characters",
                MAX_TENANT_ID_LEN
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Tenant id '{}' may only contain letters, digits and '_'",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Schema that isolates this tenant's tables, e.g. `school_greenwood`.
    pub fn schema_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Academic year label as operators write it, e.g. `2024-2025`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AcademicYear(String);

impl AcademicYear {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Academic year must contain at least one letter or digit"
            )));
        }
        if trimmed.len() > MAX_ACADEMIC_YEAR_LEN {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Academic year must be at most {} characters",
                MAX_ACADEMIC_YEAR_LEN
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier-safe suffix: every non-alphanumeric character becomes `_`.
    pub fn table_suffix(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect::<String>()
            .to_ascii_lowercase()
    }
}

impl fmt::Display for AcademicYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AcademicYear {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AcademicYear> for String {
    fn from(value: AcademicYear) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_is_normalised_to_lowercase() {
        let a = TenantId::parse("GreenWood_01").unwrap();
        let b = TenantId::parse(" greenwood_01 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.schema_name("school_"), "school_greenwood_01");
    }

    #[test]
    fn tenant_id_rejects_identifier_breaking_characters() {
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("green-wood").is_err());
        assert!(TenantId::parse("a\"; DROP SCHEMA").is_err());
        assert!(TenantId::parse(&"x".repeat(41)).is_err());
    }

    #[test]
    fn academic_year_suffix_replaces_non_alphanumerics() {
        let year = AcademicYear::parse("2024-2025").unwrap();
        assert_eq!(year.table_suffix(), "2024_2025");
        assert_eq!(year.as_str(), "2024-2025");

        let year = AcademicYear::parse("2024/25 B").unwrap();
        assert_eq!(year.table_suffix(), "2024_25_b");
    }

    #[test]
    fn academic_year_needs_some_alphanumeric_content() {
        assert!(AcademicYear::parse("--").is_err());
        assert!(AcademicYear::parse("   ").is_err());
    }
}
