//! Step execution consumer: the scheduler at the heart of the engine.
//!
//! Consumes `workflow_execution_queue`. Each message turn runs one step:
//! take the per-(execution, step) lock, check the dependency barrier,
//! assemble inputs, run the actions under the step timeout, integrate the
//! outputs into the execution context, evaluate the outgoing edges, and
//! enqueue the surviving successors. When a turn leaves every step of the
//! execution terminal and enqueues nothing new, the execution (and its
//! workflow) is closed.
//!
//! Failures inside a turn delegate to the retry controller, whose decision
//! maps to a delayed retry publish, a terminate, a continue-with-empty-
//! output, or a skip-to-step dispatch. Broker and persistence failures nack
//! the message so the broker redelivers it; in-memory state is discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashSet;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weft_types::config::EngineConfig;
use weft_types::error::{QueueError, RepositoryError};
use weft_types::execution::{ActionResult, ActionStatus, StepExecution, StepStatus};
use weft_types::queue::{STEP_QUEUE, StepQueueMessage};
use weft_types::workflow::{Node, OnFailure, WorkflowStatus};

use crate::action::ActionRegistry;
use crate::broker::MessageBroker;
use crate::condition::evaluate_edge;
use crate::context::{ContextStore, enrich_config, integrate_action_data};
use crate::event::bus::EventBus;
use crate::event::EngineEvent;
use crate::repository::execution::ExecutionRepository;
use crate::repository::workflow::WorkflowRepository;
use crate::retry::{FailureDecision, RetryController};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Infrastructure failures that abort a message turn. The run loop nacks
/// the delivery so the broker redelivers it.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("unknown step execution {0}")]
    UnknownStepExecution(Uuid),
}

// ---------------------------------------------------------------------------
// Step lock table
// ---------------------------------------------------------------------------

/// In-process mutual exclusion per `(execution, step)`.
///
/// Duplicate non-retry deliveries for a step that is already being worked
/// fail to acquire the lock and are dropped. The guard releases on every
/// exit path by virtue of `Drop`.
#[derive(Debug, Default)]
pub struct StepLocks {
    held: DashSet<(Uuid, String)>,
}

impl StepLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for a step of an execution.
    pub fn try_acquire(
        self: Arc<Self>,
        execution_id: Uuid,
        step_id: &str,
    ) -> Option<StepLockGuard> {
        let key = (execution_id, step_id.to_string());
        if self.held.insert(key.clone()) {
            Some(StepLockGuard { locks: self, key })
        } else {
            None
        }
    }
}

/// Holds one step lock until dropped.
pub struct StepLockGuard {
    locks: Arc<StepLocks>,
    key: (Uuid, String),
}

impl Drop for StepLockGuard {
    fn drop(&mut self) {
        self.locks.held.remove(&self.key);
    }
}

// ---------------------------------------------------------------------------
// StepConsumer
// ---------------------------------------------------------------------------

/// Outcome of the action loop for one step.
enum ActionLoopOutcome {
    /// Every action that mattered succeeded; the step's flat output mapping.
    Success(Map<String, Value>),
    /// An action failed and the step cannot succeed.
    Failure(String),
}

/// Consumer for `workflow_execution_queue`.
pub struct StepConsumer<W, E, B> {
    workflows: Arc<W>,
    executions: Arc<E>,
    broker: Arc<B>,
    registry: Arc<ActionRegistry>,
    contexts: Arc<ContextStore>,
    retries: Arc<RetryController>,
    locks: Arc<StepLocks>,
    events: EventBus,
    poll_interval: Duration,
    barrier_requeue_delay: Duration,
}

impl<W, E, B> StepConsumer<W, E, B>
where
    W: WorkflowRepository,
    E: ExecutionRepository,
    B: MessageBroker,
{
    /// Create a new step consumer. Consumers sharing one engine must share
    /// the context store, retry controller, and lock table.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflows: Arc<W>,
        executions: Arc<E>,
        broker: Arc<B>,
        registry: Arc<ActionRegistry>,
        contexts: Arc<ContextStore>,
        retries: Arc<RetryController>,
        locks: Arc<StepLocks>,
        events: EventBus,
        config: &EngineConfig,
    ) -> Self {
        Self {
            workflows,
            executions,
            broker,
            registry,
            contexts,
            retries,
            locks,
            events,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            barrier_requeue_delay: Duration::from_millis(config.barrier_requeue_delay_ms),
        }
    }

    /// Consume `workflow_execution_queue` until cancelled.
    ///
    /// A delivery is acked once its turn finished (including dropped
    /// duplicates); infrastructure failures nack for redelivery.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(queue = STEP_QUEUE, "step consumer started");
        while !cancel.is_cancelled() {
            let delivery = match self.broker.receive(STEP_QUEUE).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "step receive failed");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            let message: StepQueueMessage = match serde_json::from_value(delivery.payload.clone())
            {
                Ok(message) => message,
                Err(err) => {
                    tracing::error!(error = %err, "undecodable step message");
                    let _ = self.broker.nack(&delivery).await;
                    continue;
                }
            };

            match self.process(&message).await {
                Ok(()) => {
                    if let Err(err) = self.broker.ack(&delivery).await {
                        tracing::error!(error = %err, "ack failed after step turn");
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        execution_id = %message.workflow_execution_id,
                        step_id = message.step.id.as_str(),
                        error = %err,
                        "step turn failed, requeueing"
                    );
                    let _ = self.broker.nack(&delivery).await;
                }
            }
        }
        tracing::info!("step consumer stopped");
    }

    /// Run one message turn. Public so embedders and tests can drive the
    /// scheduler without the consume loop.
    pub async fn process(&self, message: &StepQueueMessage) -> Result<(), SchedulerError> {
        let execution_id = message.workflow_execution_id;
        let step = &message.step;

        // 1. Per-(execution, step) lock. Duplicate non-retry deliveries drop;
        //    a retry that races the still-running attempt comes back later.
        let Some(_guard) = Arc::clone(&self.locks).try_acquire(execution_id, &step.id) else {
            if message.is_retry {
                tracing::debug!(
                    execution_id = %execution_id,
                    step_id = step.id.as_str(),
                    "retry arrived while step is locked, deferring"
                );
                self.republish(message, Some(self.barrier_requeue_delay))
                    .await?;
            } else {
                tracing::debug!(
                    execution_id = %execution_id,
                    step_id = step.id.as_str(),
                    "duplicate step message dropped"
                );
            }
            return Ok(());
        };

        if message.is_retry {
            self.retries.begin_attempt(message.step_execution_id);
        }

        // 2. Bind (or rebuild) the execution context.
        self.ensure_context(execution_id).await?;

        // Terminal executions accept no further work; in-flight messages for
        // them drain without effect.
        if let Some(execution) = self.executions.get_execution(&execution_id).await? {
            if execution.status.is_terminal() {
                tracing::debug!(
                    execution_id = %execution_id,
                    step_id = step.id.as_str(),
                    "execution already terminal, dropping step message"
                );
                return Ok(());
            }
        }

        // 3. Dependency barrier.
        if !step.wait_for.is_empty() && !self.barrier_satisfied(message).await? {
            tracing::debug!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                "dependency barrier not satisfied, requeueing"
            );
            self.republish(message, Some(self.barrier_requeue_delay))
                .await?;
            return Ok(());
        }

        // 4. Terminal-state check: redelivered work for a finished step is a
        //    no-op.
        let record = self
            .executions
            .get_step(&message.step_execution_id)
            .await?
            .ok_or(SchedulerError::UnknownStepExecution(
                message.step_execution_id,
            ))?;
        if record.status.is_terminal() {
            tracing::debug!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                status = ?record.status,
                "step already terminal, dropping message"
            );
            return Ok(());
        }

        // 5. Transition to processing.
        self.executions
            .update_step_status(&message.step_execution_id, StepStatus::Processing)
            .await?;
        self.events.publish(EngineEvent::StepStarted {
            execution_id,
            step_id: step.id.clone(),
            step_type: step.node_type.clone(),
            attempt: message.attempt_number,
        });
        let started = Instant::now();

        // 6. Input assembly.
        let inputs = self.contexts.with_mut(execution_id, |ctx| {
            ctx.assemble_inputs(&step.input_data, message.previous_step_id.as_deref())
        });

        // 7. Action loop.
        match self.run_actions(message, &inputs).await? {
            ActionLoopOutcome::Success(outputs) => {
                // 8. Output integration.
                self.contexts.with_mut(execution_id, |ctx| {
                    ctx.set_step_output(&step.id, outputs.clone());
                    ctx.merge_variables(&step.variables);
                });

                // 9. Terminal transition.
                self.executions
                    .update_step_status(&message.step_execution_id, StepStatus::Completed)
                    .await?;
                self.events.publish(EngineEvent::StepCompleted {
                    execution_id,
                    step_id: step.id.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });

                // 10. Successor dispatch.
                let enqueued = self
                    .dispatch_successors(message, StepStatus::Completed, &outputs)
                    .await?;

                // 11. Completion detection.
                self.maybe_complete(message, enqueued).await?;
            }
            ActionLoopOutcome::Failure(error) => {
                self.handle_step_failure(message, &error).await?;
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Context
    // -----------------------------------------------------------------------

    /// Make sure an in-memory context exists for the execution, rebuilding
    /// it from persisted step executions and action results when this
    /// process has never seen the execution (crash recovery, redelivery to
    /// a fresh replica).
    async fn ensure_context(&self, execution_id: Uuid) -> Result<(), SchedulerError> {
        if self.contexts.contains(execution_id) {
            return Ok(());
        }
        let steps = self.executions.list_steps(&execution_id).await?;
        let results = self
            .executions
            .list_action_results_for_execution(&execution_id)
            .await?;
        let mut ctx = crate::context::ExecutionContext::rebuild(&steps, &results);

        // The admission payload seeds the global variables without
        // overriding anything a replayed step already set.
        if let Some(execution) = self.executions.get_execution(&execution_id).await? {
            if let Some(payload) = execution.context.as_object() {
                for (name, value) in payload {
                    ctx.global_variables
                        .entry(name.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }

        self.contexts.insert(execution_id, ctx);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Barrier
    // -----------------------------------------------------------------------

    /// A predecessor satisfies the barrier iff it completed, or failed under
    /// an on_failure=continue policy. Anything else keeps the step waiting.
    async fn barrier_satisfied(&self, message: &StepQueueMessage) -> Result<bool, SchedulerError> {
        for dependency in &message.step.wait_for {
            let predecessor = self
                .executions
                .find_step(&message.workflow_execution_id, dependency)
                .await?;
            let satisfied = match predecessor {
                Some(p) if p.status == StepStatus::Completed => true,
                Some(p) if p.status == StepStatus::Failed => {
                    p.step_definition
                        .effective_error_policy(&message.workflow.metadata)
                        .on_failure
                        == OnFailure::Continue
                }
                _ => false,
            };
            if !satisfied {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// Execute the step's actions in declaration order, persisting one
    /// `ActionResult` per invocation.
    async fn run_actions(
        &self,
        message: &StepQueueMessage,
        inputs: &Map<String, Value>,
    ) -> Result<ActionLoopOutcome, SchedulerError> {
        let step = &message.step;
        let timeout = Duration::from_millis(
            step.effective_timeout_ms(&message.workflow.metadata),
        );
        let mut outputs = Map::new();

        for action in &step.actions {
            let Some(handler) = self.registry.get(&action.action_type) else {
                let error = format!("unknown action type '{}'", action.action_type);
                self.record_action(message, &action.action_type, ActionStatus::Failed, json!({ "error": error }))
                    .await?;
                return Ok(ActionLoopOutcome::Failure(error));
            };

            let enriched = enrich_config(&action.config, inputs);
            tracing::debug!(
                execution_id = %message.workflow_execution_id,
                step_id = step.id.as_str(),
                action = action.action_type.as_str(),
                "invoking action handler"
            );

            let invocation = tokio::time::timeout(timeout, handler.execute(&enriched)).await;
            let error = match invocation {
                Ok(Ok(outcome)) if outcome.success => {
                    let data = outcome.data.unwrap_or_else(|| json!({}));
                    self.record_action(message, &action.action_type, ActionStatus::Success, data.clone())
                        .await?;
                    integrate_action_data(&mut outputs, &data);
                    continue;
                }
                Ok(Ok(outcome)) => outcome
                    .error
                    .unwrap_or_else(|| format!("action '{}' failed", action.action_type)),
                Ok(Err(fault)) => fault.to_string(),
                Err(_elapsed) => format!(
                    "action '{}' timed out after {}ms",
                    action.action_type,
                    timeout.as_millis()
                ),
            };

            self.record_action(message, &action.action_type, ActionStatus::Failed, json!({ "error": error }))
                .await?;

            if step.continue_on_action_failure {
                tracing::warn!(
                    execution_id = %message.workflow_execution_id,
                    step_id = step.id.as_str(),
                    action = action.action_type.as_str(),
                    error = error.as_str(),
                    "action failed, continuing per policy"
                );
                continue;
            }
            return Ok(ActionLoopOutcome::Failure(error));
        }

        Ok(ActionLoopOutcome::Success(outputs))
    }

    async fn record_action(
        &self,
        message: &StepQueueMessage,
        action_type: &str,
        status: ActionStatus,
        result: Value,
    ) -> Result<(), SchedulerError> {
        self.executions
            .record_action_result(&ActionResult {
                id: Uuid::now_v7(),
                step_execution_id: message.step_execution_id,
                workflow_id: message.workflow_id,
                previous_step_id: message.previous_step_id.clone(),
                step_id: message.step.id.clone(),
                action_type: action_type.to_string(),
                status,
                result,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    async fn handle_step_failure(
        &self,
        message: &StepQueueMessage,
        error: &str,
    ) -> Result<(), SchedulerError> {
        let execution_id = message.workflow_execution_id;
        let step = &message.step;
        let policy = step.effective_error_policy(&message.workflow.metadata);
        let category = RetryController::categorize(error);

        let decision = self
            .retries
            .decide(message.step_execution_id, &policy, error);

        self.events.publish(EngineEvent::StepFailed {
            execution_id,
            step_id: step.id.clone(),
            error: error.to_string(),
            category,
            will_retry: matches!(decision, FailureDecision::Retry { .. }),
        });

        match decision {
            FailureDecision::Retry { delay, attempt } => {
                // The step is not failed yet: back to queued for the retry.
                self.executions
                    .update_step_status(&message.step_execution_id, StepStatus::Queued)
                    .await?;

                let mut retry = message.clone();
                retry.is_retry = true;
                retry.attempt_number = attempt + 1;
                self.republish(&retry, Some(delay)).await?;

                self.events.publish(EngineEvent::StepRetryScheduled {
                    execution_id,
                    step_id: step.id.clone(),
                    attempt: attempt + 1,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            FailureDecision::Terminate => {
                self.executions
                    .update_step_status(&message.step_execution_id, StepStatus::Failed)
                    .await?;
                self.notify_failure(message, &policy, error);
                self.close_execution(message, WorkflowStatus::Failed).await?;
            }
            FailureDecision::Continue => {
                self.executions
                    .update_step_status(&message.step_execution_id, StepStatus::Failed)
                    .await?;
                self.notify_failure(message, &policy, error);

                // Successors still run, with an empty output set.
                let enqueued = self
                    .dispatch_successors(message, StepStatus::Failed, &Map::new())
                    .await?;
                self.maybe_complete(message, enqueued).await?;
            }
            FailureDecision::SkipTo(target) => {
                self.executions
                    .update_step_status(&message.step_execution_id, StepStatus::Failed)
                    .await?;
                self.notify_failure(message, &policy, error);

                match message.workflow.node(&target) {
                    Some(node) => {
                        let node = node.clone();
                        let enqueued = self.dispatch_node(message, &node).await?;
                        self.maybe_complete(message, enqueued).await?;
                    }
                    None => {
                        tracing::warn!(
                            execution_id = %execution_id,
                            step_id = step.id.as_str(),
                            target = target.as_str(),
                            "skip target not in graph, terminating execution"
                        );
                        self.close_execution(message, WorkflowStatus::Failed).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn notify_failure(
        &self,
        message: &StepQueueMessage,
        policy: &weft_types::workflow::ErrorPolicy,
        error: &str,
    ) {
        if policy.notify_on_failure {
            self.events.publish(EngineEvent::FailureNotification {
                execution_id: message.workflow_execution_id,
                workflow_id: message.workflow_id,
                step_id: message.step.id.clone(),
                error: error.to_string(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Successor dispatch and completion
    // -----------------------------------------------------------------------

    /// Evaluate the outgoing edges and enqueue every surviving target.
    /// Returns how many work messages were published this turn.
    async fn dispatch_successors(
        &self,
        message: &StepQueueMessage,
        status: StepStatus,
        outputs: &Map<String, Value>,
    ) -> Result<u32, SchedulerError> {
        let ctx = self
            .contexts
            .get(message.workflow_execution_id)
            .unwrap_or_default();

        let mut enqueued = 0;
        for edge in &message.step.next_steps {
            if !evaluate_edge(edge, status, outputs, &ctx) {
                tracing::debug!(
                    execution_id = %message.workflow_execution_id,
                    step_id = message.step.id.as_str(),
                    target = edge.target_id.as_str(),
                    "edge condition not met, dropping edge"
                );
                continue;
            }
            let Some(node) = message.workflow.node(&edge.target_id) else {
                tracing::warn!(
                    execution_id = %message.workflow_execution_id,
                    target = edge.target_id.as_str(),
                    "edge target missing from graph snapshot"
                );
                continue;
            };
            let node = node.clone();
            enqueued += self.dispatch_node(message, &node).await?;
        }
        Ok(enqueued)
    }

    /// Create the target's step execution if absent and publish its work
    /// message. Returns 1 when a message was published.
    async fn dispatch_node(
        &self,
        message: &StepQueueMessage,
        node: &Node,
    ) -> Result<u32, SchedulerError> {
        let execution_id = message.workflow_execution_id;
        if self
            .executions
            .find_step(&execution_id, &node.id)
            .await?
            .is_some()
        {
            // Another parent already enqueued this node.
            return Ok(0);
        }

        let step = StepExecution {
            id: Uuid::now_v7(),
            workflow_execution_id: execution_id,
            workflow_id: message.workflow_id,
            previous_step_id: Some(message.step.id.clone()),
            step_id: node.id.clone(),
            step_type: node.node_type.clone(),
            name: node.name.clone(),
            status: StepStatus::Queued,
            step_definition: node.clone(),
            created_at: Utc::now(),
            completed_at: None,
        };
        self.executions.create_step(&step).await?;

        let work = StepQueueMessage {
            workflow_id: message.workflow_id,
            workflow_execution_id: execution_id,
            step_execution_id: step.id,
            previous_step_id: Some(message.step.id.clone()),
            step: node.clone(),
            workflow: message.workflow.clone(),
            is_retry: false,
            attempt_number: 1,
        };
        self.republish(&work, None).await?;
        Ok(1)
    }

    /// Close the execution if every step is terminal and this turn enqueued
    /// nothing new.
    async fn maybe_complete(
        &self,
        message: &StepQueueMessage,
        enqueued_this_turn: u32,
    ) -> Result<(), SchedulerError> {
        if enqueued_this_turn > 0 {
            return Ok(());
        }
        let steps = self
            .executions
            .list_steps(&message.workflow_execution_id)
            .await?;
        if steps.is_empty() || !steps.iter().all(|s| s.status.is_terminal()) {
            return Ok(());
        }

        let any_failed = steps.iter().any(|s| s.status == StepStatus::Failed);
        let status = if any_failed {
            WorkflowStatus::CompletedWithErrors
        } else {
            WorkflowStatus::Completed
        };
        self.close_execution(message, status).await
    }

    /// Transition execution and workflow to a terminal status exactly once,
    /// emit the completion event, and tear down per-execution state.
    async fn close_execution(
        &self,
        message: &StepQueueMessage,
        status: WorkflowStatus,
    ) -> Result<(), SchedulerError> {
        let execution_id = message.workflow_execution_id;
        let changed = self
            .executions
            .update_execution_status(&execution_id, status)
            .await?;
        if !changed {
            // Someone else closed it; nothing to tear down twice.
            return Ok(());
        }
        self.workflows
            .update_workflow_status(&message.workflow_id, status)
            .await?;

        let steps = self.executions.list_steps(&execution_id).await?;
        let steps_completed = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count() as u32;
        let steps_failed = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count() as u32;
        let duration_ms = match self.executions.get_execution(&execution_id).await? {
            Some(execution) => (Utc::now() - execution.started_at)
                .num_milliseconds()
                .max(0) as u64,
            None => 0,
        };

        self.events.publish(EngineEvent::ExecutionCompleted {
            execution_id,
            workflow_id: message.workflow_id,
            status,
            duration_ms,
            steps_completed,
            steps_failed,
        });

        self.contexts.remove(execution_id);
        for step in &steps {
            self.retries.clear(step.id);
        }

        tracing::info!(
            execution_id = %execution_id,
            status = ?status,
            steps_completed,
            steps_failed,
            "execution closed"
        );
        Ok(())
    }

    async fn republish(
        &self,
        message: &StepQueueMessage,
        delay: Option<Duration>,
    ) -> Result<(), SchedulerError> {
        let payload = serde_json::to_value(message)
            .map_err(|e| QueueError::Payload(e.to_string()))?;
        self.broker.publish(STEP_QUEUE, &payload, delay).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
