//! Execution repository trait definition.
//!
//! Storage interface for workflow executions, step executions, and action
//! results. Status transitions and completion timestamps are the only
//! post-creation mutations the engine performs.
//!
//! Implementations must make terminal step statuses write-once: an update
//! against a step already in `Completed` or `Failed` is a no-op that
//! reports `false`, which is what lets redelivered work messages drop
//! without side effects.

use uuid::Uuid;

use weft_types::error::RepositoryError;
use weft_types::execution::{ActionResult, StepExecution, StepStatus, WorkflowExecution};
use weft_types::workflow::WorkflowStatus;

/// Repository trait for execution persistence.
pub trait ExecutionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a new workflow execution record.
    fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Transition an execution's status. Implementations stamp
    /// `completed_at` when the status is terminal, and ignore transitions
    /// out of a terminal status (completion is monotone). Returns whether a
    /// row actually changed.
    fn update_execution_status(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List executions of a workflow, newest first.
    fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Create a new step execution record.
    fn create_step(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a step execution by its UUID.
    fn get_step(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// Find the step execution for a node within an execution, if any.
    fn find_step(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// List all step executions of an execution, in creation order.
    fn list_steps(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    /// Transition a step's status. Terminal statuses are write-once;
    /// implementations stamp `completed_at` on the terminal transition.
    /// Returns whether a row actually changed.
    fn update_step_status(
        &self,
        id: &Uuid,
        status: StepStatus,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Action results
    // -----------------------------------------------------------------------

    /// Append an action result row.
    fn record_action_result(
        &self,
        result: &ActionResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List action results for one step execution, in creation order.
    fn list_action_results(
        &self,
        step_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ActionResult>, RepositoryError>> + Send;

    /// List action results across a whole execution (context rebuild).
    fn list_action_results_for_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ActionResult>, RepositoryError>> + Send;
}
