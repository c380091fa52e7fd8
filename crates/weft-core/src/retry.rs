//! Retry / failure controller.
//!
//! Owns the per-step attempt ledger, classifies errors into categories,
//! computes backoff delays, and chooses what the scheduler does with a
//! failed step: schedule a retry, terminate the execution, continue to the
//! successors with an empty output, or skip to a named node.
//!
//! The ledger and the active-retry set are process-local bookkeeping; the
//! durable retry signal is the delayed broker message the scheduler
//! publishes from the returned decision.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use weft_types::error::ErrorCategory;
use weft_types::workflow::{BackoffStrategy, ErrorPolicy, OnFailure};

// ---------------------------------------------------------------------------
// FailureDecision
// ---------------------------------------------------------------------------

/// What the scheduler should do with a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Re-enqueue the same step execution after `delay`. `attempt` is the
    /// 1-based number of the attempt that just failed.
    Retry { delay: Duration, attempt: u32 },
    /// Mark step, execution and workflow failed and stop.
    Terminate,
    /// Mark the step failed, then dispatch successors with an empty output.
    Continue,
    /// Mark the step failed, then dispatch exactly this node.
    SkipTo(String),
}

/// One recorded attempt of a step execution.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// When the attempt failed.
    pub at: DateTime<Utc>,
    /// The failure message.
    pub error: String,
    /// When the scheduled retry becomes due, if one was scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// RetryController
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Ledger {
    attempts: HashMap<Uuid, Vec<Attempt>>,
    active_retries: HashSet<Uuid>,
}

/// Per-process retry bookkeeping and failure policy engine.
#[derive(Default)]
pub struct RetryController {
    ledger: Mutex<Ledger>,
}

impl RetryController {
    /// Create an empty controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an error message into a category.
    ///
    /// Total and deterministic: case-insensitive substring matching in a
    /// fixed order, falling back to `UnknownError`.
    pub fn categorize(error: &str) -> ErrorCategory {
        let lower = error.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["timeout", "timed out"]) {
            ErrorCategory::Timeout
        } else if has(&["network", "connection", "econn", "dns"]) {
            ErrorCategory::NetworkError
        } else if has(&["rate limit", "rate_limit", "too many requests", "429"]) {
            ErrorCategory::RateLimit
        } else if has(&["permission", "forbidden", "unauthorized", "401", "403"]) {
            ErrorCategory::PermissionError
        } else if has(&["not found", "404"]) {
            ErrorCategory::NotFound
        } else if has(&["validation", "invalid"]) {
            ErrorCategory::ValidationError
        } else if has(&["quota"]) {
            ErrorCategory::QuotaExceeded
        } else {
            ErrorCategory::UnknownError
        }
    }

    /// Record a failed attempt and decide what happens next.
    ///
    /// A retry is scheduled iff the policy asks for retries, the budget
    /// (`retry_count`) is not exhausted, the error category is retryable
    /// under the policy, and no retry is already pending for this step.
    /// Otherwise the decision falls through to the policy's `on_failure`.
    pub fn decide(
        &self,
        step_execution_id: Uuid,
        policy: &ErrorPolicy,
        error: &str,
    ) -> FailureDecision {
        let category = Self::categorize(error);
        let now = Utc::now();

        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let attempts = ledger
            .attempts
            .entry(step_execution_id)
            .or_default();
        let prior_attempts = attempts.len() as u32;
        let attempt_number = prior_attempts + 1;

        let should_retry = policy.on_failure == OnFailure::Retry
            && policy.retry_count > prior_attempts
            && policy.retry_on_status.contains(&category)
            && !ledger.active_retries.contains(&step_execution_id);

        if should_retry {
            let delay = compute_backoff(policy, attempt_number);
            ledger
                .attempts
                .entry(step_execution_id)
                .or_default()
                .push(Attempt {
                    attempt_number,
                    at: now,
                    error: error.to_string(),
                    next_retry_at: Some(now + chrono::Duration::from_std(delay).unwrap_or_default()),
                });
            ledger.active_retries.insert(step_execution_id);

            tracing::debug!(
                step_execution_id = %step_execution_id,
                attempt = attempt_number,
                delay_ms = delay.as_millis() as u64,
                category = %category,
                "retry scheduled"
            );
            return FailureDecision::Retry {
                delay,
                attempt: attempt_number,
            };
        }

        ledger
            .attempts
            .entry(step_execution_id)
            .or_default()
            .push(Attempt {
                attempt_number,
                at: now,
                error: error.to_string(),
                next_retry_at: None,
            });
        drop(ledger);

        match policy.on_failure {
            OnFailure::Terminate => FailureDecision::Terminate,
            OnFailure::Continue => FailureDecision::Continue,
            OnFailure::SkipToStep => match &policy.skip_to_step_id {
                Some(target) => FailureDecision::SkipTo(target.clone()),
                None => {
                    tracing::warn!(
                        step_execution_id = %step_execution_id,
                        "skip_to_step policy without a target, terminating"
                    );
                    FailureDecision::Terminate
                }
            },
            OnFailure::Retry => {
                // Retries are exhausted or the category is not retryable;
                // there is nothing left to retry with.
                tracing::error!(
                    step_execution_id = %step_execution_id,
                    attempts = attempt_number,
                    category = %category,
                    "retry policy exhausted, terminating"
                );
                FailureDecision::Terminate
            }
        }
    }

    /// Mark the pending retry for a step as dispatched. Called when the
    /// scheduler receives the retry delivery, so a later failure of that
    /// attempt can schedule the next one.
    pub fn begin_attempt(&self, step_execution_id: Uuid) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.active_retries.remove(&step_execution_id);
    }

    /// Snapshot the recorded attempts for a step execution.
    pub fn attempts(&self, step_execution_id: Uuid) -> Vec<Attempt> {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger
            .attempts
            .get(&step_execution_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop all bookkeeping for a step execution (terminal teardown).
    pub fn clear(&self, step_execution_id: Uuid) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.attempts.remove(&step_execution_id);
        ledger.active_retries.remove(&step_execution_id);
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Compute the delay before retrying attempt `attempt_number` (1-based,
/// the attempt that just failed).
///
/// - `fixed`: `initial_delay`
/// - `linear`: `initial_delay * attempt_number`
/// - `exponential`: `initial_delay * 2^(attempt_number - 1)`
///
/// With jitter enabled the result is scaled by a random factor in
/// `[0.75, 1.25]`, then clamped to `[0, max_delay_ms]`.
pub fn compute_backoff(policy: &ErrorPolicy, attempt_number: u32) -> Duration {
    let attempt = attempt_number.max(1);
    let base = policy.initial_delay_ms as f64;
    let raw = match policy.backoff_strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base * attempt as f64,
        BackoffStrategy::Exponential => base * 2f64.powi(attempt as i32 - 1),
    };

    let jittered = if policy.jitter {
        raw * rand::thread_rng().gen_range(0.75..=1.25)
    } else {
        raw
    };

    let clamped = jittered.round().clamp(0.0, policy.max_delay_ms as f64);
    Duration::from_millis(clamped as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_policy(retry_count: u32) -> ErrorPolicy {
        ErrorPolicy {
            on_failure: OnFailure::Retry,
            retry_count,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
            retry_on_status: vec![ErrorCategory::Timeout],
            ..ErrorPolicy::default()
        }
    }

    // -----------------------------------------------------------------------
    // Categorization
    // -----------------------------------------------------------------------

    #[test]
    fn categorize_matches_known_substrings() {
        assert_eq!(
            RetryController::categorize("request Timed Out after 30s"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            RetryController::categorize("connection refused"),
            ErrorCategory::NetworkError
        );
        assert_eq!(
            RetryController::categorize("HTTP 429 Too Many Requests"),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            RetryController::categorize("403 Forbidden"),
            ErrorCategory::PermissionError
        );
        assert_eq!(
            RetryController::categorize("calendar event not found"),
            ErrorCategory::NotFound
        );
        assert_eq!(
            RetryController::categorize("validation failed: missing field"),
            ErrorCategory::ValidationError
        );
        assert_eq!(
            RetryController::categorize("monthly quota exceeded"),
            ErrorCategory::QuotaExceeded
        );
        assert_eq!(
            RetryController::categorize("something exploded"),
            ErrorCategory::UnknownError
        );
    }

    #[test]
    fn categorize_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(
                RetryController::categorize("network timeout"),
                RetryController::categorize("network timeout")
            );
        }
        // "timeout" wins over "network" by fixed ordering.
        assert_eq!(
            RetryController::categorize("network timeout"),
            ErrorCategory::Timeout
        );
    }

    // -----------------------------------------------------------------------
    // Backoff
    // -----------------------------------------------------------------------

    #[test]
    fn backoff_shapes_without_jitter() {
        let mut policy = retry_policy(5);
        policy.max_delay_ms = 100_000;

        assert_eq!(compute_backoff(&policy, 1), Duration::from_millis(100));
        assert_eq!(compute_backoff(&policy, 2), Duration::from_millis(200));
        assert_eq!(compute_backoff(&policy, 3), Duration::from_millis(400));

        policy.backoff_strategy = BackoffStrategy::Linear;
        assert_eq!(compute_backoff(&policy, 3), Duration::from_millis(300));

        policy.backoff_strategy = BackoffStrategy::Fixed;
        assert_eq!(compute_backoff(&policy, 3), Duration::from_millis(100));
    }

    #[test]
    fn backoff_clamps_to_max_delay() {
        let mut policy = retry_policy(10);
        policy.max_delay_ms = 500;
        // 100 * 2^9 far exceeds the cap.
        assert_eq!(compute_backoff(&policy, 10), Duration::from_millis(500));

        // max_delay below initial_delay clamps everything down.
        policy.max_delay_ms = 50;
        assert_eq!(compute_backoff(&policy, 1), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_within_quarter_band() {
        let mut policy = retry_policy(5);
        policy.jitter = true;
        policy.max_delay_ms = 100_000;
        for _ in 0..50 {
            let d = compute_backoff(&policy, 2).as_millis() as f64;
            assert!((150.0..=250.0).contains(&d), "jittered delay {d} out of band");
        }
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    #[test]
    fn retries_then_exhausts_within_bound() {
        let controller = RetryController::new();
        let id = Uuid::now_v7();
        let policy = retry_policy(3);

        for expected_attempt in 1..=3 {
            match controller.decide(id, &policy, "timeout") {
                FailureDecision::Retry { attempt, .. } => {
                    assert_eq!(attempt, expected_attempt);
                    controller.begin_attempt(id);
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }

        // Fourth failure: budget exhausted, retry-at-this-point terminates.
        assert_eq!(
            controller.decide(id, &policy, "timeout"),
            FailureDecision::Terminate
        );
        // Total attempts recorded never exceeds retry_count + 1.
        assert_eq!(controller.attempts(id).len(), 4);
    }

    #[test]
    fn zero_retry_count_disables_retries() {
        let controller = RetryController::new();
        let policy = retry_policy(0);
        assert_eq!(
            controller.decide(Uuid::now_v7(), &policy, "timeout"),
            FailureDecision::Terminate
        );
    }

    #[test]
    fn non_retryable_category_skips_retry() {
        let controller = RetryController::new();
        let policy = retry_policy(3);
        assert_eq!(
            controller.decide(Uuid::now_v7(), &policy, "validation failed"),
            FailureDecision::Terminate
        );
    }

    #[test]
    fn pending_retry_blocks_double_scheduling() {
        let controller = RetryController::new();
        let id = Uuid::now_v7();
        let policy = retry_policy(5);

        assert!(matches!(
            controller.decide(id, &policy, "timeout"),
            FailureDecision::Retry { .. }
        ));
        // Without begin_attempt, a duplicate failure report cannot schedule
        // a second retry.
        assert_eq!(
            controller.decide(id, &policy, "timeout"),
            FailureDecision::Terminate
        );
    }

    #[test]
    fn continue_and_skip_decisions() {
        let controller = RetryController::new();

        let policy = ErrorPolicy {
            on_failure: OnFailure::Continue,
            ..ErrorPolicy::default()
        };
        assert_eq!(
            controller.decide(Uuid::now_v7(), &policy, "boom"),
            FailureDecision::Continue
        );

        let policy = ErrorPolicy {
            on_failure: OnFailure::SkipToStep,
            skip_to_step_id: Some("cleanup".to_string()),
            ..ErrorPolicy::default()
        };
        assert_eq!(
            controller.decide(Uuid::now_v7(), &policy, "boom"),
            FailureDecision::SkipTo("cleanup".to_string())
        );

        // Missing target falls through to terminate.
        let policy = ErrorPolicy {
            on_failure: OnFailure::SkipToStep,
            skip_to_step_id: None,
            ..ErrorPolicy::default()
        };
        assert_eq!(
            controller.decide(Uuid::now_v7(), &policy, "boom"),
            FailureDecision::Terminate
        );
    }

    #[test]
    fn clear_drops_ledger_state() {
        let controller = RetryController::new();
        let id = Uuid::now_v7();
        let policy = retry_policy(3);

        let _ = controller.decide(id, &policy, "timeout");
        assert_eq!(controller.attempts(id).len(), 1);

        controller.clear(id);
        assert!(controller.attempts(id).is_empty());
        // Active flag was cleared too, so a fresh failure can retry again.
        assert!(matches!(
            controller.decide(id, &policy, "timeout"),
            FailureDecision::Retry { attempt: 1, .. }
        ));
    }
}
