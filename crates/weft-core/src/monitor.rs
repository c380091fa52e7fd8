//! Execution monitoring sidecar.
//!
//! Subscribes to the engine event bus and aggregates per-execution stats
//! (step counts, durations, error and retry rates) plus a time-windowed
//! error history for a system-wide health view. When a configured threshold
//! is exceeded, the monitor publishes an [`Alert`] event back onto the bus;
//! a pluggable [`AlertNotifier`] forwards alerts best-effort. Nothing here
//! sits on the critical path of a step.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weft_types::config::MonitorConfig;
use weft_types::workflow::WorkflowStatus;

use crate::event::bus::EventBus;
use crate::event::{Alert, AlertKind, EngineEvent};

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Aggregated statistics for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub execution_id: Uuid,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub retried_steps: u32,
    pub total_duration_ms: u64,
    pub average_step_duration_ms: u64,
    /// Failed fraction of terminal steps, in `[0, 1]`.
    pub error_rate: f64,
    /// Retried fraction of started steps, in `[0, 1]`.
    pub retry_rate: f64,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: WorkflowStatus,
}

/// System-wide health classification over the recent window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Critical,
}

// ---------------------------------------------------------------------------
// AlertNotifier
// ---------------------------------------------------------------------------

/// Delivery seam for alerts. Implementations are best-effort: a failed
/// notification never affects durable engine state.
pub trait AlertNotifier: Send + Sync {
    fn notify(
        &self,
        alert: &Alert,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Default notifier: structured log lines.
pub struct TracingAlertNotifier;

impl AlertNotifier for TracingAlertNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        tracing::warn!(
            kind = ?alert.kind,
            execution_id = ?alert.execution_id,
            value = alert.value,
            threshold = alert.threshold,
            "{}",
            alert.message
        );
        Ok(())
    }
}

/// Forward alert events from the bus to a notifier until cancelled.
pub async fn run_alert_relay<N: AlertNotifier>(
    events: EventBus,
    notifier: N,
    cancel: CancellationToken,
) {
    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(EngineEvent::Alert(alert)) => {
                    if let Err(err) = notifier.notify(&alert).await {
                        tracing::warn!(error = %err, "alert notification failed");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "alert relay lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionMonitor
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ExecutionAggregate {
    total_steps: u32,
    completed_steps: u32,
    failed_steps: u32,
    retried_steps: u32,
    step_duration_sum_ms: u64,
    total_duration_ms: u64,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: WorkflowStatus,
    alerted_error_rate: bool,
    alerted_retry_rate: bool,
    alerted_duration: bool,
}

impl ExecutionAggregate {
    fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            total_steps: 0,
            completed_steps: 0,
            failed_steps: 0,
            retried_steps: 0,
            step_duration_sum_ms: 0,
            total_duration_ms: 0,
            start_time,
            end_time: None,
            status: WorkflowStatus::Processing,
            alerted_error_rate: false,
            alerted_retry_rate: false,
            alerted_duration: false,
        }
    }

    fn error_rate(&self) -> f64 {
        let terminal = self.completed_steps + self.failed_steps;
        if terminal == 0 {
            0.0
        } else {
            self.failed_steps as f64 / terminal as f64
        }
    }

    fn retry_rate(&self) -> f64 {
        if self.total_steps == 0 {
            0.0
        } else {
            self.retried_steps as f64 / self.total_steps as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowSample {
    Completion,
    Error,
}

/// Event-bus sidecar aggregating execution statistics and raising alerts.
pub struct ExecutionMonitor {
    config: MonitorConfig,
    events: EventBus,
    executions: DashMap<Uuid, ExecutionAggregate>,
    window: Mutex<VecDeque<(DateTime<Utc>, WindowSample)>>,
}

impl ExecutionMonitor {
    /// Create a monitor publishing alerts onto the given bus.
    pub fn new(config: MonitorConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            executions: DashMap::new(),
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Consume engine events until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut rx = self.events.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => self.observe(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "monitor lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Fold one event into the aggregates, raising alerts on threshold
    /// crossings.
    pub fn observe(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ExecutionStarted { execution_id, .. } => {
                self.executions
                    .entry(*execution_id)
                    .or_insert_with(|| ExecutionAggregate::new(Utc::now()));
            }
            EngineEvent::StepStarted {
                execution_id,
                attempt,
                ..
            } => {
                let mut agg = self
                    .executions
                    .entry(*execution_id)
                    .or_insert_with(|| ExecutionAggregate::new(Utc::now()));
                if *attempt == 1 {
                    agg.total_steps += 1;
                }
            }
            EngineEvent::StepCompleted {
                execution_id,
                duration_ms,
                ..
            } => {
                if let Some(mut agg) = self.executions.get_mut(execution_id) {
                    agg.completed_steps += 1;
                    agg.step_duration_sum_ms += duration_ms;
                }
                self.push_sample(WindowSample::Completion);
            }
            EngineEvent::StepFailed {
                execution_id,
                will_retry,
                ..
            } => {
                if *will_retry {
                    return;
                }
                self.push_sample(WindowSample::Error);
                let mut raise = None;
                if let Some(mut agg) = self.executions.get_mut(execution_id) {
                    agg.failed_steps += 1;
                    let rate = agg.error_rate();
                    if rate >= self.config.error_rate_threshold && !agg.alerted_error_rate {
                        agg.alerted_error_rate = true;
                        raise = Some((rate, self.config.error_rate_threshold));
                    }
                }
                if let Some((value, threshold)) = raise {
                    self.raise(
                        AlertKind::ErrorRate,
                        Some(*execution_id),
                        format!("execution error rate {value:.2} exceeds {threshold:.2}"),
                        value,
                        threshold,
                    );
                }
            }
            EngineEvent::StepRetryScheduled { execution_id, .. } => {
                let mut raise = None;
                if let Some(mut agg) = self.executions.get_mut(execution_id) {
                    agg.retried_steps += 1;
                    let rate = agg.retry_rate();
                    if rate >= self.config.retry_rate_threshold && !agg.alerted_retry_rate {
                        agg.alerted_retry_rate = true;
                        raise = Some((rate, self.config.retry_rate_threshold));
                    }
                }
                if let Some((value, threshold)) = raise {
                    self.raise(
                        AlertKind::RetryRate,
                        Some(*execution_id),
                        format!("execution retry rate {value:.2} exceeds {threshold:.2}"),
                        value,
                        threshold,
                    );
                }
            }
            EngineEvent::ExecutionCompleted {
                execution_id,
                status,
                duration_ms,
                ..
            } => {
                let mut raise = None;
                if let Some(mut agg) = self.executions.get_mut(execution_id) {
                    agg.status = *status;
                    agg.end_time = Some(Utc::now());
                    agg.total_duration_ms = *duration_ms;
                    if *duration_ms >= self.config.duration_threshold_ms
                        && !agg.alerted_duration
                    {
                        agg.alerted_duration = true;
                        raise = Some((
                            *duration_ms as f64,
                            self.config.duration_threshold_ms as f64,
                        ));
                    }
                }
                if let Some((value, threshold)) = raise {
                    self.raise(
                        AlertKind::Duration,
                        Some(*execution_id),
                        format!("execution took {value:.0}ms, threshold {threshold:.0}ms"),
                        value,
                        threshold,
                    );
                }
            }
            EngineEvent::FailureNotification { .. } | EngineEvent::Alert(_) => {}
        }
    }

    /// Aggregated stats for one execution, if the monitor has seen it.
    pub fn stats(&self, execution_id: Uuid) -> Option<ExecutionStats> {
        self.executions.get(&execution_id).map(|agg| {
            let terminal = agg.completed_steps + agg.failed_steps;
            ExecutionStats {
                execution_id,
                total_steps: agg.total_steps,
                completed_steps: agg.completed_steps,
                failed_steps: agg.failed_steps,
                retried_steps: agg.retried_steps,
                total_duration_ms: agg.total_duration_ms,
                average_step_duration_ms: if terminal == 0 {
                    0
                } else {
                    agg.step_duration_sum_ms / terminal as u64
                },
                error_rate: agg.error_rate(),
                retry_rate: agg.retry_rate(),
                start_time: agg.start_time,
                end_time: agg.end_time,
                status: agg.status,
            }
        })
    }

    /// Health classification over the recent error window: degraded at the
    /// error-rate threshold, critical at twice the threshold.
    pub fn system_health(&self) -> SystemHealth {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut window, self.config.window_secs);

        let errors = window
            .iter()
            .filter(|(_, s)| *s == WindowSample::Error)
            .count();
        let total = window.len();
        if total == 0 {
            return SystemHealth::Healthy;
        }

        let rate = errors as f64 / total as f64;
        if rate >= self.config.error_rate_threshold * 2.0 {
            SystemHealth::Critical
        } else if rate >= self.config.error_rate_threshold {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        }
    }

    fn push_sample(&self, sample: WindowSample) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back((Utc::now(), sample));
        Self::prune(&mut window, self.config.window_secs);
    }

    fn prune(window: &mut VecDeque<(DateTime<Utc>, WindowSample)>, window_secs: u64) {
        let cutoff = Utc::now() - ChronoDuration::seconds(window_secs as i64);
        while window.front().is_some_and(|(at, _)| *at < cutoff) {
            window.pop_front();
        }
    }

    fn raise(
        &self,
        kind: AlertKind,
        execution_id: Option<Uuid>,
        message: String,
        value: f64,
        threshold: f64,
    ) {
        self.events.publish(EngineEvent::Alert(Alert {
            kind,
            execution_id,
            message,
            value,
            threshold,
            at: Utc::now(),
        }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::error::ErrorCategory;

    fn monitor(config: MonitorConfig) -> (ExecutionMonitor, EventBus) {
        let bus = EventBus::new(64);
        (ExecutionMonitor::new(config, bus.clone()), bus)
    }

    fn started(execution_id: Uuid) -> EngineEvent {
        EngineEvent::ExecutionStarted {
            execution_id,
            workflow_id: Uuid::now_v7(),
            workflow_name: "wf".to_string(),
        }
    }

    fn step_started(execution_id: Uuid, step: &str, attempt: u32) -> EngineEvent {
        EngineEvent::StepStarted {
            execution_id,
            step_id: step.to_string(),
            step_type: "enrich".to_string(),
            attempt,
        }
    }

    fn step_completed(execution_id: Uuid, step: &str, duration_ms: u64) -> EngineEvent {
        EngineEvent::StepCompleted {
            execution_id,
            step_id: step.to_string(),
            duration_ms,
        }
    }

    fn step_failed(execution_id: Uuid, step: &str, will_retry: bool) -> EngineEvent {
        EngineEvent::StepFailed {
            execution_id,
            step_id: step.to_string(),
            error: "boom".to_string(),
            category: ErrorCategory::UnknownError,
            will_retry,
        }
    }

    #[test]
    fn aggregates_step_counts_and_rates() {
        let (monitor, _bus) = monitor(MonitorConfig::default());
        let id = Uuid::now_v7();

        monitor.observe(&started(id));
        monitor.observe(&step_started(id, "a", 1));
        monitor.observe(&step_completed(id, "a", 10));
        monitor.observe(&step_started(id, "b", 1));
        monitor.observe(&EngineEvent::StepRetryScheduled {
            execution_id: id,
            step_id: "b".to_string(),
            attempt: 2,
            delay_ms: 100,
        });
        monitor.observe(&step_started(id, "b", 2));
        monitor.observe(&step_completed(id, "b", 30));
        monitor.observe(&EngineEvent::ExecutionCompleted {
            execution_id: id,
            workflow_id: Uuid::now_v7(),
            status: WorkflowStatus::Completed,
            duration_ms: 55,
            steps_completed: 2,
            steps_failed: 0,
        });

        let stats = monitor.stats(id).unwrap();
        assert_eq!(stats.total_steps, 2);
        assert_eq!(stats.completed_steps, 2);
        assert_eq!(stats.failed_steps, 0);
        assert_eq!(stats.retried_steps, 1);
        assert_eq!(stats.average_step_duration_ms, 20);
        assert_eq!(stats.total_duration_ms, 55);
        assert_eq!(stats.retry_rate, 0.5);
        assert_eq!(stats.status, WorkflowStatus::Completed);
        assert!(stats.end_time.is_some());
    }

    #[test]
    fn error_rate_threshold_raises_one_alert() {
        let (monitor, bus) = monitor(MonitorConfig {
            error_rate_threshold: 0.5,
            ..MonitorConfig::default()
        });
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        monitor.observe(&started(id));
        monitor.observe(&step_started(id, "a", 1));
        monitor.observe(&step_failed(id, "a", false));
        monitor.observe(&step_started(id, "b", 1));
        monitor.observe(&step_failed(id, "b", false));

        let mut alerts = 0;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Alert(alert) = event {
                assert_eq!(alert.kind, AlertKind::ErrorRate);
                assert_eq!(alert.execution_id, Some(id));
                alerts += 1;
            }
        }
        assert_eq!(alerts, 1, "threshold crossing alerts once");
    }

    #[test]
    fn retrying_failures_do_not_count_as_errors() {
        let (monitor, _bus) = monitor(MonitorConfig::default());
        let id = Uuid::now_v7();

        monitor.observe(&started(id));
        monitor.observe(&step_started(id, "a", 1));
        monitor.observe(&step_failed(id, "a", true));

        let stats = monitor.stats(id).unwrap();
        assert_eq!(stats.failed_steps, 0);
        assert_eq!(stats.error_rate, 0.0);
    }

    #[test]
    fn duration_threshold_raises_alert() {
        let (monitor, bus) = monitor(MonitorConfig {
            duration_threshold_ms: 50,
            ..MonitorConfig::default()
        });
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        monitor.observe(&started(id));
        monitor.observe(&EngineEvent::ExecutionCompleted {
            execution_id: id,
            workflow_id: Uuid::now_v7(),
            status: WorkflowStatus::Completed,
            duration_ms: 120,
            steps_completed: 1,
            steps_failed: 0,
        });

        let mut saw_duration_alert = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Alert(alert) = event {
                assert_eq!(alert.kind, AlertKind::Duration);
                saw_duration_alert = true;
            }
        }
        assert!(saw_duration_alert);
    }

    #[test]
    fn system_health_degrades_with_windowed_errors() {
        let (monitor, _bus) = monitor(MonitorConfig {
            error_rate_threshold: 0.25,
            ..MonitorConfig::default()
        });
        let id = Uuid::now_v7();
        monitor.observe(&started(id));

        assert_eq!(monitor.system_health(), SystemHealth::Healthy);

        // 1 error / 4 samples = 0.25 -> degraded
        monitor.observe(&step_completed(id, "a", 5));
        monitor.observe(&step_completed(id, "b", 5));
        monitor.observe(&step_completed(id, "c", 5));
        monitor.observe(&step_failed(id, "d", false));
        assert_eq!(monitor.system_health(), SystemHealth::Degraded);

        // Pile on errors past 2x the threshold -> critical
        monitor.observe(&step_failed(id, "e", false));
        monitor.observe(&step_failed(id, "f", false));
        assert_eq!(monitor.system_health(), SystemHealth::Critical);
    }

    #[tokio::test]
    async fn alert_relay_forwards_alert_events() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingNotifier(Arc<AtomicU32>);
        impl AlertNotifier for CountingNotifier {
            async fn notify(&self, _alert: &Alert) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let bus = EventBus::new(16);
        let count = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(run_alert_relay(
            bus.clone(),
            CountingNotifier(count.clone()),
            cancel.clone(),
        ));

        // Give the relay a moment to subscribe before publishing.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        bus.publish(EngineEvent::Alert(Alert {
            kind: AlertKind::ErrorRate,
            execution_id: None,
            message: "test".to_string(),
            value: 1.0,
            threshold: 0.5,
            at: Utc::now(),
        }));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cancel.cancel();
        let _ = relay.await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
