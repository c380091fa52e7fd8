//! Workflow admission consumer.
//!
//! Consumes `workflow_queue`: resolves the workflow graph (inline or by id),
//! validates it, transitions the workflow to `Processing`, creates the
//! execution and the entry step, and enqueues the first work message on
//! `workflow_execution_queue`.
//!
//! Any failure before the entry-step enqueue marks the workflow and (if
//! created) the execution `Failed`. Infrastructure errors nack the message
//! for redelivery; the admit path is idempotent under redelivery because
//! existing execution and step records are reused rather than duplicated.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weft_types::config::EngineConfig;
use weft_types::error::{QueueError, RepositoryError};
use weft_types::execution::{StepExecution, StepStatus, WorkflowExecution};
use weft_types::queue::{STEP_QUEUE, StepQueueMessage, WORKFLOW_QUEUE, WorkflowQueueMessage};
use weft_types::workflow::{Workflow, WorkflowStatus};

use crate::broker::MessageBroker;
use crate::event::bus::EventBus;
use crate::event::EngineEvent;
use crate::graph::{GraphError, validate_graph};
use crate::repository::execution::ExecutionRepository;
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// AdmissionError
// ---------------------------------------------------------------------------

/// Errors raised while admitting a workflow.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The graph failed validation.
    #[error(transparent)]
    InvalidWorkflow(#[from] GraphError),

    /// The message referenced a workflow that is not stored.
    #[error("invalid workflow: unknown workflow {0}")]
    UnknownWorkflow(Uuid),

    /// Persistence failed; the message should be redelivered.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Broker publish failed; the message should be redelivered.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl AdmissionError {
    /// Whether redelivering the message could succeed.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            AdmissionError::Repository(_) | AdmissionError::Queue(_)
        )
    }
}

// ---------------------------------------------------------------------------
// AdmissionConsumer
// ---------------------------------------------------------------------------

/// Consumer for `workflow_queue`.
pub struct AdmissionConsumer<W, E, B> {
    workflows: Arc<W>,
    executions: Arc<E>,
    broker: Arc<B>,
    events: EventBus,
    poll_interval: Duration,
}

impl<W, E, B> AdmissionConsumer<W, E, B>
where
    W: WorkflowRepository,
    E: ExecutionRepository,
    B: MessageBroker,
{
    /// Create a new admission consumer.
    pub fn new(
        workflows: Arc<W>,
        executions: Arc<E>,
        broker: Arc<B>,
        events: EventBus,
        config: &EngineConfig,
    ) -> Self {
        Self {
            workflows,
            executions,
            broker,
            events,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Consume `workflow_queue` until cancelled.
    ///
    /// Messages are acked once the admission outcome is durable; transient
    /// failures nack for redelivery, and undecodable payloads nack their way
    /// to the dead-letter queue.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(queue = WORKFLOW_QUEUE, "admission consumer started");
        while !cancel.is_cancelled() {
            let delivery = match self.broker.receive(WORKFLOW_QUEUE).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "admission receive failed");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            let message: WorkflowQueueMessage =
                match serde_json::from_value(delivery.payload.clone()) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::error!(error = %err, "undecodable admission message");
                        let _ = self.broker.nack(&delivery).await;
                        continue;
                    }
                };

            match self.admit(&message).await {
                Ok(execution_id) => {
                    tracing::info!(
                        workflow_id = %message.workflow_id,
                        execution_id = %execution_id,
                        "workflow admitted"
                    );
                    if let Err(err) = self.broker.ack(&delivery).await {
                        tracing::error!(error = %err, "ack failed after admission");
                    }
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        workflow_id = %message.workflow_id,
                        error = %err,
                        "admission failed transiently, requeueing"
                    );
                    let _ = self.broker.nack(&delivery).await;
                }
                Err(err) => {
                    // The failure is durable (workflow marked failed);
                    // redelivery cannot change the outcome.
                    tracing::error!(
                        workflow_id = %message.workflow_id,
                        error = %err,
                        "workflow rejected"
                    );
                    let _ = self.broker.ack(&delivery).await;
                }
            }
        }
        tracing::info!("admission consumer stopped");
    }

    /// Admit one workflow message. Returns the execution id on success.
    pub async fn admit(&self, message: &WorkflowQueueMessage) -> Result<Uuid, AdmissionError> {
        let workflow = self.resolve_workflow(message).await?;

        if let Err(err) = validate_graph(&workflow.nodes) {
            let _ = self
                .workflows
                .update_workflow_status(&workflow.id, WorkflowStatus::Failed)
                .await;
            if let Some(execution_id) = message.workflow_execution_id {
                let _ = self
                    .executions
                    .update_execution_status(&execution_id, WorkflowStatus::Failed)
                    .await;
            }
            return Err(err.into());
        }

        self.workflows
            .update_workflow_status(&workflow.id, WorkflowStatus::Processing)
            .await?;

        let execution = self.bind_execution(&workflow, message).await?;

        match self.enqueue_entry_step(&workflow, &execution).await {
            Ok(()) => {
                self.events.publish(EngineEvent::ExecutionStarted {
                    execution_id: execution.id,
                    workflow_id: workflow.id,
                    workflow_name: workflow.name.clone(),
                });
                Ok(execution.id)
            }
            Err(err) => {
                let _ = self
                    .workflows
                    .update_workflow_status(&workflow.id, WorkflowStatus::Failed)
                    .await;
                let _ = self
                    .executions
                    .update_execution_status(&execution.id, WorkflowStatus::Failed)
                    .await;
                Err(err)
            }
        }
    }

    /// Resolve the graph: inline from the message (persisting it), or loaded
    /// by workflow id.
    async fn resolve_workflow(
        &self,
        message: &WorkflowQueueMessage,
    ) -> Result<Workflow, AdmissionError> {
        match &message.workflow {
            Some(workflow) => {
                self.workflows.save_workflow(workflow).await?;
                Ok(workflow.clone())
            }
            None => self
                .workflows
                .get_workflow(&message.workflow_id)
                .await?
                .ok_or(AdmissionError::UnknownWorkflow(message.workflow_id)),
        }
    }

    /// Attach to the supplied execution or create a fresh one.
    async fn bind_execution(
        &self,
        workflow: &Workflow,
        message: &WorkflowQueueMessage,
    ) -> Result<WorkflowExecution, AdmissionError> {
        if let Some(execution_id) = message.workflow_execution_id {
            if let Some(existing) = self.executions.get_execution(&execution_id).await? {
                return Ok(existing);
            }
            let execution = WorkflowExecution {
                id: execution_id,
                workflow_id: workflow.id,
                status: WorkflowStatus::Processing,
                context: message.context.clone(),
                started_at: Utc::now(),
                completed_at: None,
            };
            self.executions.create_execution(&execution).await?;
            return Ok(execution);
        }

        let execution = WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_id: workflow.id,
            status: WorkflowStatus::Processing,
            context: message.context.clone(),
            started_at: Utc::now(),
            completed_at: None,
        };
        self.executions.create_execution(&execution).await?;
        Ok(execution)
    }

    /// Create (or reuse) the entry step record and publish its work message.
    async fn enqueue_entry_step(
        &self,
        workflow: &Workflow,
        execution: &WorkflowExecution,
    ) -> Result<(), AdmissionError> {
        let entry = workflow
            .entry_node()
            .ok_or(AdmissionError::InvalidWorkflow(GraphError::EmptyGraph))?;

        let step = match self.executions.find_step(&execution.id, &entry.id).await? {
            Some(existing) => existing,
            None => {
                let step = StepExecution {
                    id: Uuid::now_v7(),
                    workflow_execution_id: execution.id,
                    workflow_id: workflow.id,
                    previous_step_id: None,
                    step_id: entry.id.clone(),
                    step_type: entry.node_type.clone(),
                    name: entry.name.clone(),
                    status: StepStatus::Queued,
                    step_definition: entry.clone(),
                    created_at: Utc::now(),
                    completed_at: None,
                };
                self.executions.create_step(&step).await?;
                step
            }
        };

        let work = StepQueueMessage {
            workflow_id: workflow.id,
            workflow_execution_id: execution.id,
            step_execution_id: step.id,
            previous_step_id: None,
            step: entry.clone(),
            workflow: workflow.clone(),
            is_retry: false,
            attempt_number: 1,
        };
        self.broker
            .publish(STEP_QUEUE, &serde_json::to_value(&work).map_err(|e| {
                QueueError::Payload(e.to_string())
            })?, None)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::broker::InMemoryBroker;
    use crate::repository::memory::InMemoryRepository;

    fn consumer(
        repo: Arc<InMemoryRepository>,
        broker: Arc<InMemoryBroker>,
    ) -> AdmissionConsumer<InMemoryRepository, InMemoryRepository, InMemoryBroker> {
        AdmissionConsumer::new(
            repo.clone(),
            repo,
            broker,
            EventBus::new(16),
            &EngineConfig::default(),
        )
    }

    fn linear_workflow() -> Workflow {
        serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "name": "meeting-prep",
            "nodes": [
                { "id": "a", "type": "trigger", "next_steps": [{ "target_id": "b" }] },
                { "id": "b", "type": "terminator" }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn admit_creates_execution_and_enqueues_entry_step() {
        let repo = Arc::new(InMemoryRepository::new());
        let broker = Arc::new(InMemoryBroker::default());
        let consumer = consumer(repo.clone(), broker.clone());
        let workflow = linear_workflow();

        let execution_id = consumer
            .admit(&WorkflowQueueMessage {
                workflow_id: workflow.id,
                workflow: Some(workflow.clone()),
                workflow_execution_id: None,
                context: json!({ "event_id": "E1" }),
            })
            .await
            .unwrap();

        let stored = repo.get_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Processing);

        let execution = repo.get_execution(&execution_id).await.unwrap().unwrap();
        assert_eq!(execution.context["event_id"], json!("E1"));

        let step = repo.find_step(&execution_id, "a").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Queued);
        assert!(step.previous_step_id.is_none());

        assert_eq!(broker.depth(STEP_QUEUE), 1);
        let delivery = broker.receive(STEP_QUEUE).await.unwrap().unwrap();
        let work: StepQueueMessage = serde_json::from_value(delivery.payload).unwrap();
        assert_eq!(work.step.id, "a");
        assert_eq!(work.attempt_number, 1);
        assert!(!work.is_retry);
    }

    #[tokio::test]
    async fn invalid_graph_marks_workflow_failed() {
        let repo = Arc::new(InMemoryRepository::new());
        let broker = Arc::new(InMemoryBroker::default());
        let consumer = consumer(repo.clone(), broker.clone());

        let workflow: Workflow = serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "name": "broken",
            "nodes": [
                { "id": "a", "type": "trigger", "next_steps": [{ "target_id": "ghost" }] }
            ]
        }))
        .unwrap();

        let err = consumer
            .admit(&WorkflowQueueMessage {
                workflow_id: workflow.id,
                workflow: Some(workflow.clone()),
                workflow_execution_id: None,
                context: json!({}),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AdmissionError::InvalidWorkflow(_)));
        let stored = repo.get_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Failed);
        assert_eq!(broker.depth(STEP_QUEUE), 0);
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected() {
        let repo = Arc::new(InMemoryRepository::new());
        let broker = Arc::new(InMemoryBroker::default());
        let consumer = consumer(repo, broker);

        let err = consumer
            .admit(&WorkflowQueueMessage {
                workflow_id: Uuid::now_v7(),
                workflow: None,
                workflow_execution_id: None,
                context: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownWorkflow(_)));
    }

    #[tokio::test]
    async fn redelivery_reuses_execution_and_step() {
        let repo = Arc::new(InMemoryRepository::new());
        let broker = Arc::new(InMemoryBroker::default());
        let consumer = consumer(repo.clone(), broker.clone());
        let workflow = linear_workflow();
        let execution_id = Uuid::now_v7();

        let message = WorkflowQueueMessage {
            workflow_id: workflow.id,
            workflow: Some(workflow.clone()),
            workflow_execution_id: Some(execution_id),
            context: json!({}),
        };

        let first = consumer.admit(&message).await.unwrap();
        let second = consumer.admit(&message).await.unwrap();
        assert_eq!(first, execution_id);
        assert_eq!(second, execution_id);

        // One step record despite two admissions.
        let steps = repo.list_steps(&execution_id).await.unwrap();
        assert_eq!(steps.len(), 1);
    }
}
