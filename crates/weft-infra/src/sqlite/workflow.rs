//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `weft-core` using sqlx with split
//! read/write pools. The graph definition is stored as a JSON blob; the
//! status column is authoritative and overrides the status frozen inside
//! the blob on read.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use weft_core::repository::workflow::WorkflowRepository;
use weft_types::error::RepositoryError;
use weft_types::workflow::{Workflow, WorkflowStatus};

use super::pool::DatabasePool;
use super::{enum_from_str, enum_to_str, format_datetime};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    status: String,
    definition: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            status: row.try_get("status")?,
            definition: row.try_get("definition")?,
        })
    }

    fn into_workflow(self) -> Result<Workflow, RepositoryError> {
        let mut workflow: Workflow = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow JSON: {e}")))?;
        workflow.status = enum_from_str::<WorkflowStatus>(&self.status)?;
        Ok(workflow)
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let definition = serde_json::to_string(workflow)
            .map_err(|e| RepositoryError::Query(format!("serialize workflow: {e}")))?;
        let status = enum_to_str(&workflow.status)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, status, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&status)
        .bind(&definition)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT status, definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = WorkflowRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_workflow()?))
            }
            None => Ok(None),
        }
    }

    async fn update_workflow_status(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
    ) -> Result<(), RepositoryError> {
        let status = enum_to_str(&status)?;
        let now = format_datetime(&Utc::now());

        let result = sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE id = ?")
            .bind(&status)
            .bind(&now)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_repo() -> (SqliteWorkflowRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("wf.db").display());
        let pool = DatabasePool::open(&url, 2).await.unwrap();
        (SqliteWorkflowRepository::new(pool), dir)
    }

    fn sample_workflow() -> Workflow {
        serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "name": "meeting-prep",
            "status": "active",
            "nodes": [
                { "id": "a", "type": "trigger", "next_steps": [{ "target_id": "b" }] },
                { "id": "b", "type": "terminator" }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn save_and_get_roundtrip() {
        let (repo, _dir) = test_repo().await;
        let workflow = sample_workflow();

        repo.save_workflow(&workflow).await.unwrap();
        let loaded = repo.get_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "meeting-prep");
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.status, WorkflowStatus::Active);

        assert!(repo.get_workflow(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_column_overrides_blob() {
        let (repo, _dir) = test_repo().await;
        let workflow = sample_workflow();
        repo.save_workflow(&workflow).await.unwrap();

        repo.update_workflow_status(&workflow.id, WorkflowStatus::Processing)
            .await
            .unwrap();
        let loaded = repo.get_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Processing);
    }

    #[tokio::test]
    async fn update_missing_workflow_is_not_found() {
        let (repo, _dir) = test_repo().await;
        let err = repo
            .update_workflow_status(&Uuid::now_v7(), WorkflowStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let (repo, _dir) = test_repo().await;
        let workflow = sample_workflow();
        repo.save_workflow(&workflow).await.unwrap();

        assert!(repo.delete_workflow(&workflow.id).await.unwrap());
        assert!(!repo.delete_workflow(&workflow.id).await.unwrap());
    }
}
