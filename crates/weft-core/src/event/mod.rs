//! Engine events and the broadcast bus that distributes them.

pub mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_types::error::ErrorCategory;
use weft_types::workflow::WorkflowStatus;

/// Events emitted by the engine while executions progress.
///
/// The scheduler and admission consumer publish these; monitoring and
/// notification sit on the receiving end. Publishing is fire-and-forget and
/// never on the critical path of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// An execution was admitted and its entry step enqueued.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        workflow_name: String,
    },
    /// An execution reached a terminal status.
    ExecutionCompleted {
        execution_id: Uuid,
        workflow_id: Uuid,
        status: WorkflowStatus,
        duration_ms: u64,
        steps_completed: u32,
        steps_failed: u32,
    },
    /// A step entered processing.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_type: String,
        attempt: u32,
    },
    /// A step completed successfully.
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },
    /// A step attempt failed.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
        category: ErrorCategory,
        will_retry: bool,
    },
    /// A retry was scheduled for a failed step.
    StepRetryScheduled {
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// A step with `notify_on_failure` finally failed. Best-effort.
    FailureNotification {
        execution_id: Uuid,
        workflow_id: Uuid,
        step_id: String,
        error: String,
    },
    /// A monitoring threshold was exceeded.
    Alert(Alert),
}

/// A threshold alert emitted by the execution monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Which threshold tripped.
    pub kind: AlertKind,
    /// Execution the alert refers to, when scoped to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    /// Human-readable description.
    pub message: String,
    /// Observed value.
    pub value: f64,
    /// Configured threshold that was exceeded.
    pub threshold: f64,
    /// When the alert was raised.
    pub at: DateTime<Utc>,
}

/// The monitored quantity an alert refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ErrorRate,
    RetryRate,
    Duration,
}
