//! Workflow domain types for Weft.
//!
//! Defines the canonical intermediate representation for workflows: a
//! [`Workflow`] is a directed graph of [`Node`]s whose effects are produced
//! by named actions, with conditional [`EdgeDescriptor`] routing and a
//! per-node [`ErrorPolicy`]. Graph editors, the CLI, and the admission queue
//! all converge on this representation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ErrorCategory;

// ---------------------------------------------------------------------------
// Workflow (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition: a named, versioned graph of nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Version string (e.g. "3").
    #[serde(default = "default_version")]
    pub version: String,
    /// Lifecycle status, mutated only by status transitions after creation.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Ordered node list. The first node is the entry point.
    pub nodes: Vec<Node>,
    /// Engine-level defaults applied when a node leaves a field unset.
    #[serde(default)]
    pub metadata: WorkflowMetadata,
}

impl Workflow {
    /// The entry node, i.e. the first node of the graph.
    pub fn entry_node(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// Look up a node by its id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

fn default_version() -> String {
    "1".to_string()
}

/// Lifecycle status of a workflow (and of an execution of it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Inactive,
    Processing,
    Failed,
    Completed,
    CompletedWithErrors,
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        WorkflowStatus::Draft
    }
}

impl WorkflowStatus {
    /// Whether this status is terminal for an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Failed
                | WorkflowStatus::Completed
                | WorkflowStatus::CompletedWithErrors
        )
    }
}

/// Workflow-level defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Default per-node timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    /// Default error policy for nodes that do not declare one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_error_policy: Option<ErrorPolicy>,
}

// ---------------------------------------------------------------------------
// Node (step definition)
// ---------------------------------------------------------------------------

/// A single node ("step definition") in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// User-defined node id (e.g. "gather-event"). Unique within a workflow.
    pub id: String,
    /// The kind of step (e.g. "trigger", "enrich", "notify").
    #[serde(rename = "type")]
    pub node_type: String,
    /// Human-readable node name.
    #[serde(default)]
    pub name: String,
    /// Actions to perform, executed strictly in declaration order.
    #[serde(default)]
    pub actions: Vec<ActionBinding>,
    /// Outgoing edges evaluated against this node's output.
    #[serde(default)]
    pub next_steps: Vec<EdgeDescriptor>,
    /// Requested input fields. Tokens may be qualified as
    /// `step.<id>.<field>` or `variables.<name>`; bare names scan all
    /// prior step outputs.
    #[serde(default)]
    pub input_data: Vec<String>,
    /// Predecessor node ids that must be terminal before this node runs.
    #[serde(default)]
    pub wait_for: Vec<String>,
    /// Entries copied into the execution's global variables on completion.
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// What to do when the node cannot succeed. Falls back to the workflow
    /// metadata default, then to terminate-with-no-retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorPolicy>,
    /// Persist a failed action result and continue with the next action
    /// instead of failing the whole step.
    #[serde(default)]
    pub continue_on_action_failure: bool,
    /// Per-action timeout in milliseconds. Falls back to the workflow
    /// metadata default, then to 30 000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Node {
    /// Effective per-action timeout for this node.
    pub fn effective_timeout_ms(&self, metadata: &WorkflowMetadata) -> u64 {
        self.timeout_ms
            .or(metadata.default_timeout_ms)
            .unwrap_or_else(default_timeout_ms)
    }

    /// Effective error policy for this node.
    pub fn effective_error_policy(&self, metadata: &WorkflowMetadata) -> ErrorPolicy {
        self.error_handling
            .clone()
            .or_else(|| metadata.default_error_policy.clone())
            .unwrap_or_default()
    }
}

/// Default per-action timeout (30 seconds).
pub fn default_timeout_ms() -> u64 {
    30_000
}

/// One action of a node: a handler tag, its configuration, and the output
/// fields the handler is expected to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBinding {
    /// Registry tag of the handler that produces this action's effect.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Handler configuration. Opaque here; typed inside the handler.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Ordered output field names this action contributes.
    #[serde(default)]
    pub outputs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// An outgoing edge: which node to run next, under which condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    /// Id of the target node.
    pub target_id: String,
    /// Legacy status gate: "always", "success" or "failure".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Typed condition applied to the producing step's output.
    #[serde(default)]
    pub condition_type: ConditionType,
    /// Field the condition inspects, resolved from the step output or the
    /// execution context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_field: Option<String>,
    /// Comparison operand for the comparison condition types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_value: Option<Value>,
    /// Display label for graph editors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Advisory list of fields the target step should receive.
    #[serde(default)]
    pub input_data: Vec<String>,
}

/// Condition applied to an edge. Both historical spellings of the
/// comparison types (`equals` / `if_equals`) deserialize to the same
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Always,
    IfNotEmpty,
    IfEmpty,
    #[serde(alias = "if_equals")]
    Equals,
    #[serde(alias = "if_not_equals")]
    NotEquals,
    #[serde(alias = "if_contains")]
    Contains,
    GreaterThan,
    LessThan,
}

impl Default for ConditionType {
    fn default() -> Self {
        ConditionType::Always
    }
}

impl ConditionType {
    /// Whether this condition requires `condition_field` to be present.
    pub fn requires_field(&self) -> bool {
        !matches!(self, ConditionType::Always)
    }

    /// Whether this condition requires `condition_value` to be present.
    pub fn requires_value(&self) -> bool {
        matches!(
            self,
            ConditionType::Equals
                | ConditionType::NotEquals
                | ConditionType::Contains
                | ConditionType::GreaterThan
                | ConditionType::LessThan
        )
    }
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// Per-node failure handling: retry budget, backoff shape, and the action
/// taken once retries are exhausted or disallowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPolicy {
    /// Action taken when the node cannot succeed.
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Target node for `skip_to_step`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_to_step_id: Option<String>,
    /// Maximum number of retries. Zero disables retries.
    #[serde(default)]
    pub retry_count: u32,
    /// Shape of the delay between attempts.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any computed delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Error categories eligible for retry.
    #[serde(default = "default_retry_on_status")]
    pub retry_on_status: Vec<ErrorCategory>,
    /// Apply +/-25% random jitter to computed delays.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Emit a failure notification event when the node finally fails.
    #[serde(default)]
    pub notify_on_failure: bool,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            on_failure: OnFailure::default(),
            skip_to_step_id: None,
            retry_count: 0,
            backoff_strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_on_status: default_retry_on_status(),
            jitter: default_jitter(),
            notify_on_failure: false,
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_retry_on_status() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::NetworkError,
        ErrorCategory::Timeout,
        ErrorCategory::RateLimit,
    ]
}

fn default_jitter() -> bool {
    true
}

/// Action taken when a step cannot succeed after its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Terminate,
    Continue,
    Retry,
    SkipToStep,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Terminate
    }
}

/// Shape of the delay between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
    Fixed,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: "enrich".to_string(),
            name: format!("Node {id}"),
            actions: vec![ActionBinding {
                action_type: "echo".to_string(),
                config: Map::new(),
                outputs: vec!["message".to_string()],
            }],
            next_steps: vec![],
            input_data: vec![],
            wait_for: vec![],
            variables: Map::new(),
            error_handling: None,
            continue_on_action_failure: false,
            timeout_ms: None,
        }
    }

    // -----------------------------------------------------------------------
    // Serde round-trips and defaults
    // -----------------------------------------------------------------------

    #[test]
    fn workflow_roundtrip() {
        let wf = Workflow {
            id: Uuid::now_v7(),
            name: "meeting-prep".to_string(),
            version: "2".to_string(),
            status: WorkflowStatus::Active,
            nodes: vec![sample_node("a"), sample_node("b")],
            metadata: WorkflowMetadata::default(),
        };

        let json = serde_json::to_string(&wf).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "meeting-prep");
        assert_eq!(back.nodes.len(), 2);
        assert_eq!(back.entry_node().unwrap().id, "a");
        assert_eq!(back.node("b").unwrap().name, "Node b");
        assert!(back.node("missing").is_none());
    }

    #[test]
    fn node_defaults_from_minimal_json() {
        let node: Node = serde_json::from_value(json!({
            "id": "start",
            "type": "trigger"
        }))
        .unwrap();

        let metadata = WorkflowMetadata::default();
        assert_eq!(node.effective_timeout_ms(&metadata), 30_000);
        assert!(node.actions.is_empty());
        assert!(node.wait_for.is_empty());
        assert!(!node.continue_on_action_failure);
        assert_eq!(
            node.effective_error_policy(&metadata).on_failure,
            OnFailure::Terminate
        );
    }

    #[test]
    fn metadata_defaults_apply_when_node_is_silent() {
        let node: Node = serde_json::from_value(json!({
            "id": "enrich",
            "type": "enrich"
        }))
        .unwrap();
        let metadata = WorkflowMetadata {
            default_timeout_ms: Some(5_000),
            default_error_policy: Some(ErrorPolicy {
                retry_count: 2,
                ..ErrorPolicy::default()
            }),
        };

        assert_eq!(node.effective_timeout_ms(&metadata), 5_000);
        assert_eq!(node.effective_error_policy(&metadata).retry_count, 2);

        // A node-level value wins over the metadata default.
        let explicit: Node = serde_json::from_value(json!({
            "id": "enrich",
            "type": "enrich",
            "timeout_ms": 1_000
        }))
        .unwrap();
        assert_eq!(explicit.effective_timeout_ms(&metadata), 1_000);
    }

    #[test]
    fn error_policy_defaults() {
        let policy = ErrorPolicy::default();
        assert_eq!(policy.retry_count, 0);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(policy.initial_delay_ms, 1_000);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert!(policy.jitter);
        assert_eq!(
            policy.retry_on_status,
            vec![
                ErrorCategory::NetworkError,
                ErrorCategory::Timeout,
                ErrorCategory::RateLimit
            ]
        );
    }

    // -----------------------------------------------------------------------
    // Condition type spellings
    // -----------------------------------------------------------------------

    #[test]
    fn condition_type_accepts_both_spellings() {
        let a: ConditionType = serde_json::from_value(json!("equals")).unwrap();
        let b: ConditionType = serde_json::from_value(json!("if_equals")).unwrap();
        assert_eq!(a, ConditionType::Equals);
        assert_eq!(b, ConditionType::Equals);

        let c: ConditionType = serde_json::from_value(json!("not_equals")).unwrap();
        let d: ConditionType = serde_json::from_value(json!("if_not_equals")).unwrap();
        assert_eq!(c, ConditionType::NotEquals);
        assert_eq!(d, ConditionType::NotEquals);
    }

    #[test]
    fn condition_type_requirements() {
        assert!(!ConditionType::Always.requires_field());
        assert!(ConditionType::IfEmpty.requires_field());
        assert!(!ConditionType::IfEmpty.requires_value());
        assert!(ConditionType::Equals.requires_value());
        assert!(ConditionType::GreaterThan.requires_value());
    }

    #[test]
    fn edge_defaults_to_always() {
        let edge: EdgeDescriptor = serde_json::from_value(json!({
            "target_id": "next"
        }))
        .unwrap();
        assert_eq!(edge.condition_type, ConditionType::Always);
        assert!(edge.condition_field.is_none());
        assert!(edge.input_data.is_empty());
    }

    // -----------------------------------------------------------------------
    // Status helpers
    // -----------------------------------------------------------------------

    #[test]
    fn workflow_status_terminality() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::CompletedWithErrors.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::Processing.is_terminal());
        assert!(!WorkflowStatus::Draft.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_value(WorkflowStatus::CompletedWithErrors).unwrap();
        assert_eq!(s, json!("completed_with_errors"));
    }
}
