//! Broker message envelopes and queue names.
//!
//! Two durable queues drive the engine: `workflow_queue` carries admission
//! requests, `workflow_execution_queue` carries per-step work. Both payloads
//! are self-contained so a consumer can process a message without further
//! definition lookups.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{Node, Workflow};

/// Queue carrying workflow admission requests.
pub const WORKFLOW_QUEUE: &str = "workflow_queue";

/// Queue carrying per-step work messages.
pub const STEP_QUEUE: &str = "workflow_execution_queue";

/// Suffix appended to a queue name for its dead-letter target.
pub const DEAD_LETTER_SUFFIX: &str = ".dead_letter";

/// Admission request: start (or resume) an execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowQueueMessage {
    /// The workflow to execute.
    pub workflow_id: Uuid,
    /// Inline graph; when absent the consumer loads it by `workflow_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Workflow>,
    /// Pre-created execution to attach to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_execution_id: Option<Uuid>,
    /// Opaque initial execution payload.
    #[serde(default)]
    pub context: Value,
}

/// Per-step work message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepQueueMessage {
    pub workflow_id: Uuid,
    pub workflow_execution_id: Uuid,
    pub step_execution_id: Uuid,
    /// Node that enqueued this step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_step_id: Option<String>,
    /// Frozen snapshot of the node to execute.
    pub step: Node,
    /// The full graph, for successor dispatch and skip-to resolution.
    pub workflow: Workflow,
    /// Whether this delivery is a scheduled retry.
    #[serde(default)]
    pub is_retry: bool,
    /// 1-based attempt number.
    #[serde(default = "default_attempt_number")]
    pub attempt_number: u32,
}

fn default_attempt_number() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workflow_message_minimal_json() {
        let msg: WorkflowQueueMessage = serde_json::from_value(json!({
            "workflow_id": Uuid::now_v7(),
            "context": { "event_id": "E1" }
        }))
        .unwrap();

        assert!(msg.workflow.is_none());
        assert!(msg.workflow_execution_id.is_none());
        assert_eq!(msg.context["event_id"], json!("E1"));
    }

    #[test]
    fn step_message_defaults() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "name": "wf",
            "nodes": [{ "id": "a", "type": "trigger" }]
        }))
        .unwrap();

        let msg: StepQueueMessage = serde_json::from_value(json!({
            "workflow_id": workflow.id,
            "workflow_execution_id": Uuid::now_v7(),
            "step_execution_id": Uuid::now_v7(),
            "step": workflow.nodes[0],
            "workflow": workflow
        }))
        .unwrap();

        assert!(!msg.is_retry);
        assert_eq!(msg.attempt_number, 1);
    }
}
