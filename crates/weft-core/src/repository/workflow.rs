//! Workflow repository trait definition.
//!
//! Storage interface for workflow definitions. The infrastructure layer
//! (weft-infra) implements this trait with SQLite persistence. After
//! creation the engine mutates nothing but the status.

use uuid::Uuid;

use weft_types::error::RepositoryError;
use weft_types::workflow::{Workflow, WorkflowStatus};

/// Repository trait for workflow persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    /// Upsert a workflow (insert or replace by id).
    fn save_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow by its UUID.
    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Transition a workflow's status.
    fn update_workflow_status(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a workflow and, through the aggregate cascade, all of its
    /// executions, steps, and action results. Returns `true` if it existed.
    fn delete_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
