//! SQLite execution repository implementation.
//!
//! Persists workflow executions, step executions (with their frozen node
//! snapshots), and action results. Terminal statuses are enforced
//! write-once at the SQL layer with conditional UPDATEs, which is what
//! makes redelivered work messages harmless.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use weft_core::repository::execution::ExecutionRepository;
use weft_types::error::RepositoryError;
use weft_types::execution::{
    ActionResult, ActionStatus, StepExecution, StepStatus, WorkflowExecution,
};
use weft_types::workflow::{Node, WorkflowStatus};

use super::pool::DatabasePool;
use super::{enum_from_str, enum_to_str, format_datetime, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    workflow_id: String,
    status: String,
    context: String,
    started_at: String,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution, RepositoryError> {
        Ok(WorkflowExecution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            status: enum_from_str::<WorkflowStatus>(&self.status)?,
            context: serde_json::from_str(&self.context)
                .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

struct StepRow {
    id: String,
    workflow_execution_id: String,
    workflow_id: String,
    previous_step_id: Option<String>,
    step_id: String,
    step_type: String,
    name: String,
    status: String,
    step_definition: String,
    created_at: String,
    completed_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_execution_id: row.try_get("workflow_execution_id")?,
            workflow_id: row.try_get("workflow_id")?,
            previous_step_id: row.try_get("previous_step_id")?,
            step_id: row.try_get("step_id")?,
            step_type: row.try_get("step_type")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            step_definition: row.try_get("step_definition")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_step(self) -> Result<StepExecution, RepositoryError> {
        let step_definition: Node = serde_json::from_str(&self.step_definition)
            .map_err(|e| RepositoryError::Query(format!("invalid step snapshot JSON: {e}")))?;
        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            workflow_execution_id: parse_uuid(&self.workflow_execution_id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            previous_step_id: self.previous_step_id,
            step_id: self.step_id,
            step_type: self.step_type,
            name: self.name,
            status: enum_from_str::<StepStatus>(&self.status)?,
            step_definition,
            created_at: parse_datetime(&self.created_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

struct ActionResultRow {
    id: String,
    step_execution_id: String,
    workflow_id: String,
    previous_step_id: Option<String>,
    step_id: String,
    action_type: String,
    status: String,
    result: String,
    created_at: String,
}

impl ActionResultRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            step_execution_id: row.try_get("step_execution_id")?,
            workflow_id: row.try_get("workflow_id")?,
            previous_step_id: row.try_get("previous_step_id")?,
            step_id: row.try_get("step_id")?,
            action_type: row.try_get("action_type")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_result(self) -> Result<ActionResult, RepositoryError> {
        Ok(ActionResult {
            id: parse_uuid(&self.id)?,
            step_execution_id: parse_uuid(&self.step_execution_id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            previous_step_id: self.previous_step_id,
            step_id: self.step_id,
            action_type: self.action_type,
            status: enum_from_str::<ActionStatus>(&self.status)?,
            result: serde_json::from_str(&self.result)
                .map_err(|e| RepositoryError::Query(format!("invalid result JSON: {e}")))?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

const TERMINAL_WORKFLOW_STATUSES: &str = "('completed', 'completed_with_errors', 'failed')";
const TERMINAL_STEP_STATUSES: &str = "('completed', 'failed')";

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<(), RepositoryError> {
        let context = serde_json::to_string(&execution.context)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, workflow_id, status, context, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(enum_to_str(&execution.status)?)
        .bind(&context)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_execution(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn update_execution_status(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
    ) -> Result<bool, RepositoryError> {
        let completed_at = status.is_terminal().then(|| format_datetime(&Utc::now()));

        let sql = format!(
            "UPDATE workflow_executions
             SET status = ?, completed_at = COALESCE(?, completed_at)
             WHERE id = ? AND status NOT IN {TERMINAL_WORKFLOW_STATUSES}"
        );
        let result = sqlx::query(&sql)
            .bind(enum_to_str(&status)?)
            .bind(&completed_at)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_executions WHERE workflow_id = ?
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(workflow_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    async fn create_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let snapshot = serde_json::to_string(&step.step_definition)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"INSERT INTO step_executions
               (id, workflow_execution_id, workflow_id, previous_step_id, step_id,
                step_type, name, status, step_definition, created_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.workflow_execution_id.to_string())
        .bind(step.workflow_id.to_string())
        .bind(&step.previous_step_id)
        .bind(&step.step_id)
        .bind(&step.step_type)
        .bind(&step.name)
        .bind(enum_to_str(&step.status)?)
        .bind(&snapshot)
        .bind(format_datetime(&step.created_at))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // Another consumer created the (execution, step) pair first.
                Err(RepositoryError::Conflict(format!(
                    "step '{}' already exists for execution {}",
                    step.step_id, step.workflow_execution_id
                )))
            }
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get_step(&self, id: &Uuid) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM step_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r =
                    StepRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_step()?))
            }
            None => Ok(None),
        }
    }

    async fn find_step(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM step_executions WHERE workflow_execution_id = ? AND step_id = ?",
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r =
                    StepRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_step()?))
            }
            None => Ok(None),
        }
    }

    async fn list_steps(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE workflow_execution_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            steps.push(r.into_step()?);
        }
        Ok(steps)
    }

    async fn update_step_status(
        &self,
        id: &Uuid,
        status: StepStatus,
    ) -> Result<bool, RepositoryError> {
        let completed_at = status.is_terminal().then(|| format_datetime(&Utc::now()));

        let sql = format!(
            "UPDATE step_executions
             SET status = ?, completed_at = COALESCE(?, completed_at)
             WHERE id = ? AND status NOT IN {TERMINAL_STEP_STATUSES}"
        );
        let result = sqlx::query(&sql)
            .bind(enum_to_str(&status)?)
            .bind(&completed_at)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_action_result(&self, result: &ActionResult) -> Result<(), RepositoryError> {
        let payload = serde_json::to_string(&result.result)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO action_results
               (id, step_execution_id, workflow_id, previous_step_id, step_id,
                action_type, status, result, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(result.id.to_string())
        .bind(result.step_execution_id.to_string())
        .bind(result.workflow_id.to_string())
        .bind(&result.previous_step_id)
        .bind(&result.step_id)
        .bind(&result.action_type)
        .bind(enum_to_str(&result.status)?)
        .bind(&payload)
        .bind(format_datetime(&result.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_action_results(
        &self,
        step_execution_id: &Uuid,
    ) -> Result<Vec<ActionResult>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM action_results WHERE step_execution_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(step_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ActionResultRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            results.push(r.into_result()?);
        }
        Ok(results)
    }

    async fn list_action_results_for_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ActionResult>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT ar.* FROM action_results ar
             JOIN step_executions se ON se.id = ar.step_execution_id
             WHERE se.workflow_execution_id = ?
             ORDER BY ar.created_at ASC, ar.id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ActionResultRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            results.push(r.into_result()?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
