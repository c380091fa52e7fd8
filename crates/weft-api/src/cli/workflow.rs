//! Workflow CLI commands: submit, runs, steps.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use uuid::Uuid;

use weft_core::broker::MessageBroker;
use weft_core::repository::execution::ExecutionRepository;
use weft_types::queue::{WORKFLOW_QUEUE, WorkflowQueueMessage};
use weft_types::workflow::Workflow;

use crate::state::AppState;

/// Submit a workflow document to the admission queue.
///
/// Pre-allocates the execution id so `--watch` can poll it without a
/// round-trip through the engine.
pub async fn submit(
    state: &AppState,
    file: &Path,
    context: &str,
    watch: bool,
    json: bool,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let workflow: Workflow =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    let context: serde_json::Value =
        serde_json::from_str(context).context("parsing --context JSON")?;

    let execution_id = Uuid::now_v7();
    let message = WorkflowQueueMessage {
        workflow_id: workflow.id,
        workflow: Some(workflow.clone()),
        workflow_execution_id: Some(execution_id),
        context,
    };
    state
        .broker
        .publish(WORKFLOW_QUEUE, &serde_json::to_value(&message)?, None)
        .await?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "workflow_id": workflow.id,
                "execution_id": execution_id,
                "submitted": true
            })
        );
    } else {
        println!("submitted workflow '{}' ({})", workflow.name, workflow.id);
        println!("execution {execution_id}");
    }

    if watch {
        watch_execution(state, execution_id, json).await?;
    }
    Ok(())
}

/// Poll an execution until it reaches a terminal status.
async fn watch_execution(
    state: &AppState,
    execution_id: Uuid,
    json: bool,
) -> anyhow::Result<()> {
    loop {
        if let Some(execution) = state.executions.get_execution(&execution_id).await? {
            if execution.status.is_terminal() {
                if json {
                    println!("{}", serde_json::to_string_pretty(&execution)?);
                } else {
                    println!("execution {execution_id} finished: {:?}", execution.status);
                }
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// List executions of a workflow, newest first.
pub async fn runs(
    state: &AppState,
    workflow_id: Uuid,
    limit: u32,
    json: bool,
) -> anyhow::Result<()> {
    let executions = state.executions.list_executions(&workflow_id, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("no executions for workflow {workflow_id}");
        return Ok(());
    }
    for execution in &executions {
        let finished = execution
            .completed_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<24}  started {}  finished {}",
            execution.id,
            format!("{:?}", execution.status),
            execution.started_at.to_rfc3339(),
            finished
        );
    }
    Ok(())
}

/// Show the step executions of one execution.
pub async fn steps(state: &AppState, execution_id: Uuid, json: bool) -> anyhow::Result<()> {
    let steps = state.executions.list_steps(&execution_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    if steps.is_empty() {
        println!("no steps for execution {execution_id}");
        return Ok(());
    }
    for step in &steps {
        let results = state.executions.list_action_results(&step.id).await?;
        println!(
            "{:<20} {:<12} {:?}  actions: {}",
            step.step_id,
            step.step_type,
            step.status,
            results.len()
        );
    }
    Ok(())
}
