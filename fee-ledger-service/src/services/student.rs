//! Upstream student identity lookup.

use crate::models::{Student, TenantId};
use crate::services::database::{db_err, is_unique_violation};
use crate::services::registry::TenantConnectionRegistry;
use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};

#[async_trait]
pub trait StudentDirectory: Send + Sync {
    async fn find(
        &self,
        tenant_id: &TenantId,
        admission_number: &str,
    ) -> Result<Option<Student>, AppError>;
}

/// Reads the tenant's `students` table.
pub struct PgStudentDirectory {
    registry: Arc<TenantConnectionRegistry>,
}

impl PgStudentDirectory {
    pub fn new(registry: Arc<TenantConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Admit a student. A reused admission number is a conflict.
    #[instrument(skip(self, student), fields(tenant_id = %tenant_id, admission_number = %student.admission_number))]
    pub async fn register(&self, tenant_id: &TenantId, student: &Student) -> Result<(), AppError> {
        let pool = self.registry.get_connection(tenant_id).await?;

        sqlx::query(
            r#"
            INSERT INTO students (admission_number, full_name, standard, section)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(student.admission_number.trim())
        .bind(&student.full_name)
        .bind(&student.standard)
        .bind(&student.section)
        .execute(&pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Admission number {} already exists",
                    student.admission_number
                ))
            } else {
                db_err("register student")(e)
            }
        })?;

        info!("Student registered");
        Ok(())
    }
}

#[async_trait]
impl StudentDirectory for PgStudentDirectory {
    async fn find(
        &self,
        tenant_id: &TenantId,
        admission_number: &str,
    ) -> Result<Option<Student>, AppError> {
        let pool = self.registry.get_connection(tenant_id).await?;

        sqlx::query_as::<_, Student>(
            r#"
            SELECT admission_number, full_name, standard, section
            FROM students
            WHERE admission_number = $1
            "#,
        )
        .bind(admission_number.trim())
        .fetch_optional(&pool)
        .await
        .map_err(db_err("find student"))
    }
}
