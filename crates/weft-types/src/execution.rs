//! Execution tracking types: runtime instances of workflows and their steps.
//!
//! A [`WorkflowExecution`] is one run of a workflow; each node visited during
//! the run gets a [`StepExecution`] row, and each action invoked within a
//! step gets an [`ActionResult`] row. Together these records make the
//! in-memory execution context reconstructable after a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{Node, WorkflowStatus};

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// One runtime instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    /// The workflow definition being executed.
    pub workflow_id: Uuid,
    /// Current status; mirrors the workflow status vocabulary.
    pub status: WorkflowStatus,
    /// Opaque initial payload supplied at admission.
    pub context: Value,
    /// When the execution was admitted.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

/// Status of an individual step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl StepStatus {
    /// Whether the step has reached a terminal status. Terminal statuses are
    /// write-once: once `Completed` or `Failed`, a step never changes again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// One runtime instance of a node within a workflow execution.
///
/// At most one `StepExecution` exists per `(workflow_execution_id, step_id)`;
/// the scheduler enforces this via its per-step lock and create-if-absent
/// successor dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 step execution id.
    pub id: Uuid,
    /// Parent execution.
    pub workflow_execution_id: Uuid,
    /// Workflow the execution belongs to (denormalized).
    pub workflow_id: Uuid,
    /// Node that enqueued this step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_step_id: Option<String>,
    /// Node id within the workflow graph.
    pub step_id: String,
    /// Node type tag (denormalized for display).
    pub step_type: String,
    /// Node name (denormalized for display).
    pub name: String,
    /// Current status.
    pub status: StepStatus,
    /// Frozen snapshot of the node as admitted, so that later edits to the
    /// workflow definition cannot change an in-flight execution.
    pub step_definition: Node,
    /// When this step was enqueued.
    pub created_at: DateTime<Utc>,
    /// When this step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// ActionResult
// ---------------------------------------------------------------------------

/// Outcome status of one action invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
}

/// Durable record of one action invocation within a step.
///
/// `result` is a structured value at this seam; serialization to storage is
/// the persistence adapter's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// UUIDv7 action result id.
    pub id: Uuid,
    /// Step execution this action ran under.
    pub step_execution_id: Uuid,
    /// Workflow the execution belongs to (denormalized).
    pub workflow_id: Uuid,
    /// Node that enqueued the owning step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_step_id: Option<String>,
    /// Node id of the owning step.
    pub step_id: String,
    /// Handler tag that produced this result.
    pub action_type: String,
    /// Success or failure.
    pub status: ActionStatus,
    /// Handler output data on success, or an error description on failure.
    pub result: Value,
    /// When the action finished.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

/// An external integration configuration. The engine only reads these;
/// lifecycle management belongs to an external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    /// Unique integration type tag (e.g. "calendar").
    pub integration_type: String,
    /// Display name.
    pub name: String,
    /// Opaque configuration payload.
    pub config: Value,
    /// Free-form status string maintained by the integration manager.
    pub status: String,
    /// When the integration was last health-checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tested_at: Option<DateTime<Utc>>,
    /// Last health-check error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Whether handlers may use this integration.
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::default_timeout_ms;
    use serde_json::json;

    fn sample_node() -> Node {
        serde_json::from_value(json!({
            "id": "start",
            "type": "trigger"
        }))
        .unwrap()
    }

    #[test]
    fn step_status_terminality() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Queued.is_terminal());
        assert!(!StepStatus::Processing.is_terminal());
    }

    #[test]
    fn step_execution_roundtrip_preserves_snapshot() {
        let step = StepExecution {
            id: Uuid::now_v7(),
            workflow_execution_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            previous_step_id: None,
            step_id: "start".to_string(),
            step_type: "trigger".to_string(),
            name: "Start".to_string(),
            status: StepStatus::Queued,
            step_definition: sample_node(),
            created_at: Utc::now(),
            completed_at: None,
        };

        let json = serde_json::to_string(&step).unwrap();
        let back: StepExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step_definition.id, "start");
        assert_eq!(
            back.step_definition
                .effective_timeout_ms(&Default::default()),
            default_timeout_ms()
        );
        assert_eq!(back.status, StepStatus::Queued);
    }

    #[test]
    fn action_result_holds_structured_value() {
        let result = ActionResult {
            id: Uuid::now_v7(),
            step_execution_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            previous_step_id: Some("start".to_string()),
            step_id: "enrich".to_string(),
            action_type: "echo".to_string(),
            status: ActionStatus::Success,
            result: json!({ "company": "Acme", "employees": 250 }),
            created_at: Utc::now(),
        };

        let back: ActionResult =
            serde_json::from_str(&serde_json::to_string(&result).unwrap()).unwrap();
        assert_eq!(back.result["company"], json!("Acme"));
        assert_eq!(back.status, ActionStatus::Success);
    }
}
