//! In-memory repository implementation.
//!
//! Backs the engine test-suites and embedded deployments that do not need
//! durability. Implements the same write-once terminal semantics as the
//! SQLite adapter so invariant tests exercise identical behavior.

use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use weft_types::error::RepositoryError;
use weft_types::execution::{
    ActionResult, Integration, StepExecution, StepStatus, WorkflowExecution,
};
use weft_types::workflow::{Workflow, WorkflowStatus};

use super::execution::ExecutionRepository;
use super::integration::IntegrationRepository;
use super::workflow::WorkflowRepository;

/// Non-durable repository for tests and embedded use.
#[derive(Default)]
pub struct InMemoryRepository {
    workflows: DashMap<Uuid, Workflow>,
    executions: DashMap<Uuid, WorkflowExecution>,
    steps: DashMap<Uuid, StepExecution>,
    action_results: Mutex<Vec<ActionResult>>,
    integrations: DashMap<String, Integration>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an integration (test/embedded convenience).
    pub fn put_integration(&self, integration: Integration) {
        self.integrations
            .insert(integration.integration_type.clone(), integration);
    }
}

impl WorkflowRepository for InMemoryRepository {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.workflows.get(id).map(|w| w.value().clone()))
    }

    async fn update_workflow_status(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
    ) -> Result<(), RepositoryError> {
        match self.workflows.get_mut(id) {
            Some(mut workflow) => {
                workflow.status = status;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let existed = self.workflows.remove(id).is_some();
        if existed {
            let doomed: Vec<Uuid> = self
                .executions
                .iter()
                .filter(|e| e.workflow_id == *id)
                .map(|e| e.id)
                .collect();
            for execution_id in doomed {
                self.executions.remove(&execution_id);
                self.steps
                    .retain(|_, step| step.workflow_execution_id != execution_id);
            }
            self.action_results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|r| r.workflow_id != *id);
        }
        Ok(existed)
    }
}

impl ExecutionRepository for InMemoryRepository {
    async fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<(), RepositoryError> {
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    async fn update_execution_status(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
    ) -> Result<bool, RepositoryError> {
        match self.executions.get_mut(id) {
            Some(mut execution) => {
                if execution.status.is_terminal() {
                    return Ok(false);
                }
                execution.status = status;
                if status.is_terminal() {
                    execution.completed_at = Some(Utc::now());
                }
                Ok(true)
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut executions: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| e.workflow_id == *workflow_id)
            .map(|e| e.value().clone())
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        executions.truncate(limit as usize);
        Ok(executions)
    }

    async fn create_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        self.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn get_step(&self, id: &Uuid) -> Result<Option<StepExecution>, RepositoryError> {
        Ok(self.steps.get(id).map(|s| s.value().clone()))
    }

    async fn find_step(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        Ok(self
            .steps
            .iter()
            .find(|s| s.workflow_execution_id == *execution_id && s.step_id == step_id)
            .map(|s| s.value().clone()))
    }

    async fn list_steps(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let mut steps: Vec<StepExecution> = self
            .steps
            .iter()
            .filter(|s| s.workflow_execution_id == *execution_id)
            .map(|s| s.value().clone())
            .collect();
        steps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(steps)
    }

    async fn update_step_status(
        &self,
        id: &Uuid,
        status: StepStatus,
    ) -> Result<bool, RepositoryError> {
        match self.steps.get_mut(id) {
            Some(mut step) => {
                if step.status.is_terminal() {
                    return Ok(false);
                }
                step.status = status;
                if status.is_terminal() {
                    step.completed_at = Some(Utc::now());
                }
                Ok(true)
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn record_action_result(&self, result: &ActionResult) -> Result<(), RepositoryError> {
        self.action_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        Ok(())
    }

    async fn list_action_results(
        &self,
        step_execution_id: &Uuid,
    ) -> Result<Vec<ActionResult>, RepositoryError> {
        Ok(self
            .action_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.step_execution_id == *step_execution_id)
            .cloned()
            .collect())
    }

    async fn list_action_results_for_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ActionResult>, RepositoryError> {
        let step_ids: Vec<Uuid> = self
            .steps
            .iter()
            .filter(|s| s.workflow_execution_id == *execution_id)
            .map(|s| s.id)
            .collect();
        Ok(self
            .action_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| step_ids.contains(&r.step_execution_id))
            .cloned()
            .collect())
    }
}

impl IntegrationRepository for InMemoryRepository {
    async fn get_integration(
        &self,
        integration_type: &str,
    ) -> Result<Option<Integration>, RepositoryError> {
        Ok(self.integrations.get(integration_type).map(|i| i.value().clone()))
    }

    async fn list_enabled(&self) -> Result<Vec<Integration>, RepositoryError> {
        Ok(self
            .integrations
            .iter()
            .filter(|i| i.enabled)
            .map(|i| i.value().clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow() -> Workflow {
        serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "name": "wf",
            "nodes": [{ "id": "a", "type": "trigger" }]
        }))
        .unwrap()
    }

    fn sample_execution(workflow_id: Uuid) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_id,
            status: WorkflowStatus::Processing,
            context: json!({}),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn sample_step(execution: &WorkflowExecution, step_id: &str) -> StepExecution {
        StepExecution {
            id: Uuid::now_v7(),
            workflow_execution_id: execution.id,
            workflow_id: execution.workflow_id,
            previous_step_id: None,
            step_id: step_id.to_string(),
            step_type: "trigger".to_string(),
            name: step_id.to_string(),
            status: StepStatus::Queued,
            step_definition: serde_json::from_value(json!({ "id": step_id, "type": "trigger" }))
                .unwrap(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn terminal_step_status_is_write_once() {
        let repo = InMemoryRepository::new();
        let workflow = sample_workflow();
        let execution = sample_execution(workflow.id);
        let step = sample_step(&execution, "a");
        repo.create_step(&step).await.unwrap();

        assert!(repo.update_step_status(&step.id, StepStatus::Completed).await.unwrap());
        // Further transitions are ignored.
        assert!(!repo.update_step_status(&step.id, StepStatus::Failed).await.unwrap());
        let stored = repo.get_step(&step.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StepStatus::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn execution_completion_is_monotone() {
        let repo = InMemoryRepository::new();
        let workflow = sample_workflow();
        let execution = sample_execution(workflow.id);
        repo.create_execution(&execution).await.unwrap();

        assert!(
            repo.update_execution_status(&execution.id, WorkflowStatus::Completed)
                .await
                .unwrap()
        );
        assert!(
            !repo
                .update_execution_status(&execution.id, WorkflowStatus::Failed)
                .await
                .unwrap()
        );
        let stored = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn delete_workflow_cascades() {
        let repo = InMemoryRepository::new();
        let workflow = sample_workflow();
        let execution = sample_execution(workflow.id);
        let step = sample_step(&execution, "a");

        repo.save_workflow(&workflow).await.unwrap();
        repo.create_execution(&execution).await.unwrap();
        repo.create_step(&step).await.unwrap();
        repo.record_action_result(&ActionResult {
            id: Uuid::now_v7(),
            step_execution_id: step.id,
            workflow_id: workflow.id,
            previous_step_id: None,
            step_id: "a".to_string(),
            action_type: "noop".to_string(),
            status: weft_types::execution::ActionStatus::Success,
            result: json!({}),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        assert!(repo.delete_workflow(&workflow.id).await.unwrap());
        assert!(repo.get_execution(&execution.id).await.unwrap().is_none());
        assert!(repo.get_step(&step.id).await.unwrap().is_none());
        assert!(repo.list_action_results(&step.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_step_by_execution_and_node() {
        let repo = InMemoryRepository::new();
        let workflow = sample_workflow();
        let execution = sample_execution(workflow.id);
        let step = sample_step(&execution, "a");
        repo.create_step(&step).await.unwrap();

        let found = repo.find_step(&execution.id, "a").await.unwrap();
        assert_eq!(found.unwrap().id, step.id);
        assert!(repo.find_step(&execution.id, "b").await.unwrap().is_none());
    }
}
