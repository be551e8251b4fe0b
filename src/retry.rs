//! # Retry Outcome Computation
//!
//! Decides what happens after a failed attempt: cancel the run, fail it
//! permanently, or retry it at a computed instant (optionally on a larger
//! machine after an out-of-memory failure).
//!
//! The worker usually decides the retry delay from the task's own retry
//! configuration and sends it with the completion. Failures the engine detects
//! itself (stalls, heartbeat timeouts) carry no such decision, so the engine
//! applies its default [`RetryOptions`] with exponential backoff and jitter.

use crate::models::{TaskRun, TaskRunError, TaskRunErrorCode, TaskRunExecutionRetry};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const MAX_ERROR_FIELD_LENGTH: usize = 10_000;

/// Retry policy locked onto a run at trigger time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub factor: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub randomize: bool,
    /// Machine to escalate to when an attempt is killed for running out of memory
    pub out_of_memory_machine: Option<String>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            factor: 2.0,
            min_timeout_ms: 1_000,
            max_timeout_ms: 60_000,
            randomize: true,
            out_of_memory_machine: None,
        }
    }
}

impl RetryOptions {
    /// Backoff before the attempt following `attempt_number` (1-based).
    pub fn delay_for_attempt(&self, attempt_number: u32) -> u64 {
        let exponent = attempt_number.saturating_sub(1).min(32) as i32;
        let base = self.min_timeout_ms as f64 * self.factor.max(1.0).powi(exponent);
        let jittered = if self.randomize {
            let mut rng = rand::thread_rng();
            base * rng.gen_range(1.0..2.0)
        } else {
            base
        };
        (jittered.round() as u64).min(self.max_timeout_ms.max(self.min_timeout_ms))
    }
}

/// Closed set of decisions after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    CancelRun {
        reason: Option<String>,
    },
    FailRun {
        sanitized_error: TaskRunError,
        was_oom_error: bool,
    },
    Retry {
        retry_at: DateTime<Utc>,
        delay_ms: u64,
        /// Machine override for the next attempt
        machine: Option<String>,
        sanitized_error: TaskRunError,
        was_oom_error: bool,
    },
}

/// Inputs for [`retry_outcome_from_completion`].
#[derive(Debug, Clone)]
pub struct RetryOutcomeParams<'a> {
    pub run: &'a TaskRun,
    pub error: &'a TaskRunError,
    pub retry: Option<&'a TaskRunExecutionRetry>,
    pub skipped_retrying: bool,
    /// Attempt that just failed
    pub attempt_number: u32,
    /// Policy for failures the worker could not decide on
    pub default_options: &'a RetryOptions,
    pub now: DateTime<Utc>,
}

pub fn retry_outcome_from_completion(params: RetryOutcomeParams<'_>) -> RetryOutcome {
    let sanitized_error = sanitize_error(params.error);
    let was_oom_error = params.error.is_oom();

    if params.error.internal_code() == Some(TaskRunErrorCode::TaskRunCancelled) {
        return RetryOutcome::CancelRun {
            reason: Some(params.error.message()),
        };
    }

    let fail = |sanitized_error: TaskRunError| RetryOutcome::FailRun {
        sanitized_error,
        was_oom_error,
    };

    if params.skipped_retrying {
        return fail(sanitized_error);
    }

    if let Some(code) = params.error.internal_code() {
        if !code.is_retryable() {
            return fail(sanitized_error);
        }
    }

    if params.attempt_number >= params.run.effective_max_attempts() {
        return fail(sanitized_error);
    }

    // Out of memory only retries when there is somewhere bigger to go.
    if was_oom_error {
        let escalation = params
            .run
            .retry_options
            .as_ref()
            .and_then(|options| options.out_of_memory_machine.clone());
        return match escalation {
            Some(machine) if params.run.machine_preset.as_deref() != Some(machine.as_str()) => {
                let (retry_at, delay_ms) = retry_timing(&params);
                RetryOutcome::Retry {
                    retry_at,
                    delay_ms,
                    machine: Some(machine),
                    sanitized_error,
                    was_oom_error,
                }
            }
            _ => fail(sanitized_error),
        };
    }

    match (params.retry, params.error.internal_code()) {
        (Some(retry), _) => RetryOutcome::Retry {
            retry_at: retry.timestamp,
            delay_ms: retry.delay_ms,
            machine: None,
            sanitized_error,
            was_oom_error,
        },
        // Engine-detected failures: the worker never got to decide.
        (None, Some(_)) => {
            let (retry_at, delay_ms) = retry_timing(&params);
            RetryOutcome::Retry {
                retry_at,
                delay_ms,
                machine: None,
                sanitized_error,
                was_oom_error,
            }
        }
        (None, None) => fail(sanitized_error),
    }
}

fn retry_timing(params: &RetryOutcomeParams<'_>) -> (DateTime<Utc>, u64) {
    if let Some(retry) = params.retry {
        return (retry.timestamp, retry.delay_ms);
    }
    let options = params
        .run
        .retry_options
        .as_ref()
        .unwrap_or(params.default_options);
    let delay_ms = options.delay_for_attempt(params.attempt_number);
    (params.now + Duration::milliseconds(delay_ms as i64), delay_ms)
}

/// Strip characters the stores reject and bound the size of free-form fields.
pub fn sanitize_error(error: &TaskRunError) -> TaskRunError {
    match error {
        TaskRunError::BuiltInError {
            name,
            message,
            stack_trace,
        } => TaskRunError::BuiltInError {
            name: sanitize_field(name),
            message: sanitize_field(message),
            stack_trace: stack_trace.as_deref().map(sanitize_field),
        },
        TaskRunError::CustomError { raw } => TaskRunError::CustomError {
            raw: sanitize_field(raw),
        },
        TaskRunError::StringError { raw } => TaskRunError::StringError {
            raw: sanitize_field(raw),
        },
        TaskRunError::InternalError {
            code,
            message,
            stack_trace,
        } => TaskRunError::InternalError {
            code: *code,
            message: message.as_deref().map(sanitize_field),
            stack_trace: stack_trace.as_deref().map(sanitize_field),
        },
    }
}

fn sanitize_field(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '\u{0}')
        .take(MAX_ERROR_FIELD_LENGTH)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RuntimeEnvironmentType, TaskRunStatus};
    use uuid::Uuid;

    fn run_with(max_attempts: Option<u32>, retry_options: Option<RetryOptions>) -> TaskRun {
        let now = Utc::now();
        TaskRun {
            id: Uuid::now_v7(),
            friendly_id: "run_test".into(),
            task_identifier: "task".into(),
            queue: "task/task".into(),
            concurrency_key: None,
            master_queue: "main".into(),
            status: TaskRunStatus::Executing,
            attempt_number: 1,
            max_attempts,
            retry_options,
            machine_preset: None,
            payload: serde_json::json!({}),
            payload_type: "application/json".into(),
            output: None,
            output_type: None,
            error: None,
            metadata: None,
            runtime_environment_id: Uuid::now_v7(),
            environment_type: RuntimeEnvironmentType::Development,
            project_id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            parent_task_run_id: None,
            root_task_run_id: None,
            depth: 0,
            batch_id: None,
            batch_index: None,
            resume_parent_on_completion: false,
            associated_waitpoint_id: None,
            ttl_ms: None,
            delay_until: None,
            debounce_key: None,
            priority_ms: 0,
            queue_timestamp: None,
            latest_snapshot_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            executed_at: None,
            completed_at: None,
            expired_at: None,
        }
    }

    fn params<'a>(
        run: &'a TaskRun,
        error: &'a TaskRunError,
        retry: Option<&'a TaskRunExecutionRetry>,
        defaults: &'a RetryOptions,
    ) -> RetryOutcomeParams<'a> {
        RetryOutcomeParams {
            run,
            error,
            retry,
            skipped_retrying: false,
            attempt_number: run.attempt_number,
            default_options: defaults,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_cancel_error_cancels() {
        let run = run_with(Some(3), None);
        let error = TaskRunError::internal(TaskRunErrorCode::TaskRunCancelled, "cancelled");
        let defaults = RetryOptions::default();
        assert!(matches!(
            retry_outcome_from_completion(params(&run, &error, None, &defaults)),
            RetryOutcome::CancelRun { .. }
        ));
    }

    #[test]
    fn test_worker_retry_is_honoured() {
        let run = run_with(Some(3), None);
        let error = TaskRunError::string("boom");
        let retry = TaskRunExecutionRetry {
            timestamp: Utc::now(),
            delay_ms: 250,
        };
        let defaults = RetryOptions::default();
        match retry_outcome_from_completion(params(&run, &error, Some(&retry), &defaults)) {
            RetryOutcome::Retry { delay_ms, machine, .. } => {
                assert_eq!(delay_ms, 250);
                assert!(machine.is_none());
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_attempts_fail() {
        let mut run = run_with(Some(2), None);
        run.attempt_number = 2;
        let error = TaskRunError::string("boom");
        let retry = TaskRunExecutionRetry {
            timestamp: Utc::now(),
            delay_ms: 10,
        };
        let defaults = RetryOptions::default();
        assert!(matches!(
            retry_outcome_from_completion(params(&run, &error, Some(&retry), &defaults)),
            RetryOutcome::FailRun { .. }
        ));
    }

    #[test]
    fn test_task_error_without_retry_fails() {
        let run = run_with(Some(5), None);
        let error = TaskRunError::string("boom");
        let defaults = RetryOptions::default();
        assert!(matches!(
            retry_outcome_from_completion(params(&run, &error, None, &defaults)),
            RetryOutcome::FailRun { .. }
        ));
    }

    #[test]
    fn test_stall_uses_default_backoff() {
        let run = run_with(Some(5), None);
        let error = TaskRunError::internal(TaskRunErrorCode::TaskRunStalledExecuting, "stalled");
        let defaults = RetryOptions {
            randomize: false,
            min_timeout_ms: 100,
            ..RetryOptions::default()
        };
        match retry_outcome_from_completion(params(&run, &error, None, &defaults)) {
            RetryOutcome::Retry { delay_ms, .. } => assert_eq!(delay_ms, 100),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_oom_escalates_machine_once() {
        let options = RetryOptions {
            out_of_memory_machine: Some("large-1x".into()),
            ..RetryOptions::default()
        };
        let mut run = run_with(Some(5), Some(options));
        let error = TaskRunError::internal(TaskRunErrorCode::TaskProcessOomKilled, "oom");
        let defaults = RetryOptions::default();
        match retry_outcome_from_completion(params(&run, &error, None, &defaults)) {
            RetryOutcome::Retry {
                machine,
                was_oom_error,
                ..
            } => {
                assert_eq!(machine.as_deref(), Some("large-1x"));
                assert!(was_oom_error);
            }
            other => panic!("expected retry, got {other:?}"),
        }

        run.machine_preset = Some("large-1x".into());
        assert!(matches!(
            retry_outcome_from_completion(params(&run, &error, None, &defaults)),
            RetryOutcome::FailRun { was_oom_error: true, .. }
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        let options = RetryOptions {
            randomize: false,
            min_timeout_ms: 1_000,
            max_timeout_ms: 5_000,
            factor: 10.0,
            ..RetryOptions::default()
        };
        assert_eq!(options.delay_for_attempt(1), 1_000);
        assert_eq!(options.delay_for_attempt(2), 5_000);
        assert_eq!(options.delay_for_attempt(40), 5_000);
    }

    #[test]
    fn test_sanitize_strips_nul() {
        let sanitized = sanitize_error(&TaskRunError::string("a\u{0}b"));
        assert_eq!(sanitized, TaskRunError::string("ab"));
    }
}
