//! SQLite integration repository implementation.
//!
//! Read-only from the engine's point of view: rows are written by the
//! external integration manager, the engine only looks them up for
//! handlers.

use sqlx::Row;

use weft_core::repository::integration::IntegrationRepository;
use weft_types::error::RepositoryError;
use weft_types::execution::Integration;

use super::pool::DatabasePool;
use super::parse_datetime;

/// SQLite-backed implementation of `IntegrationRepository`.
pub struct SqliteIntegrationRepository {
    pool: DatabasePool,
}

impl SqliteIntegrationRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn integration_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Integration, RepositoryError> {
    let config: String = row
        .try_get("config")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let last_tested_at: Option<String> = row
        .try_get("last_tested_at")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let enabled: i64 = row
        .try_get("enabled")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

    Ok(Integration {
        integration_type: row
            .try_get("integration_type")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        name: row
            .try_get("name")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        config: serde_json::from_str(&config)
            .map_err(|e| RepositoryError::Query(format!("invalid integration config: {e}")))?,
        status: row
            .try_get("status")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        last_tested_at: last_tested_at.as_deref().map(parse_datetime).transpose()?,
        last_error: row
            .try_get("last_error")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        enabled: enabled != 0,
    })
}

impl IntegrationRepository for SqliteIntegrationRepository {
    async fn get_integration(
        &self,
        integration_type: &str,
    ) -> Result<Option<Integration>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM integrations WHERE integration_type = ?")
            .bind(integration_type)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(integration_from_row).transpose()
    }

    async fn list_enabled(&self) -> Result<Vec<Integration>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM integrations WHERE enabled = 1 ORDER BY integration_type ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(integration_from_row).collect()
    }
}
