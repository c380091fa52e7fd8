//! The `serve` command: run the engine until interrupted.
//!
//! Starts the admission consumer, the configured number of step consumers
//! (sharing one context store, retry controller, and lock table), the
//! execution monitor, and the alert relay. Ctrl-c cancels the token;
//! consumers stop taking new messages and in-flight turns finish before
//! the process exits.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use weft_core::admission::AdmissionConsumer;
use weft_core::context::ContextStore;
use weft_core::repository::integration::IntegrationRepository;
use weft_core::monitor::{ExecutionMonitor, TracingAlertNotifier, run_alert_relay};
use weft_core::retry::RetryController;
use weft_core::scheduler::{StepConsumer, StepLocks};

use crate::state::AppState;

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    match state.integrations.list_enabled().await {
        Ok(integrations) => {
            for integration in &integrations {
                tracing::info!(
                    integration = integration.integration_type.as_str(),
                    status = integration.status.as_str(),
                    "integration available"
                );
            }
        }
        Err(err) => tracing::warn!(error = %err, "could not list integrations"),
    }

    let contexts = Arc::new(ContextStore::new());
    let retries = Arc::new(RetryController::new());
    let locks = Arc::new(StepLocks::new());

    let mut tasks = tokio::task::JoinSet::new();

    // Admission consumer.
    {
        let consumer = AdmissionConsumer::new(
            state.workflows.clone(),
            state.executions.clone(),
            state.broker.clone(),
            state.events.clone(),
            &state.config,
        );
        let cancel = cancel.clone();
        tasks.spawn(async move { consumer.run(cancel).await });
    }

    // Step consumers.
    for worker in 0..state.config.step_consumers {
        let consumer = StepConsumer::new(
            state.workflows.clone(),
            state.executions.clone(),
            state.broker.clone(),
            state.registry.clone(),
            contexts.clone(),
            retries.clone(),
            locks.clone(),
            state.events.clone(),
            &state.config,
        );
        let cancel = cancel.clone();
        tasks.spawn(async move {
            tracing::debug!(worker, "step consumer online");
            consumer.run(cancel).await;
        });
    }

    // Monitoring sidecar and alert relay.
    {
        let monitor = ExecutionMonitor::new(state.config.monitor.clone(), state.events.clone());
        let cancel = cancel.clone();
        tasks.spawn(async move { monitor.run(cancel).await });
    }
    {
        let events = state.events.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            run_alert_relay(events, TracingAlertNotifier, cancel).await;
        });
    }

    tracing::info!(
        step_consumers = state.config.step_consumers,
        "engine running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, draining consumers");
    cancel.cancel();

    while tasks.join_next().await.is_some() {}
    Ok(())
}
