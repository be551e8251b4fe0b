use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Codes for failures detected by the platform rather than thrown by task code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunErrorCode {
    TaskRunCancelled,
    MaxDurationExceeded,
    TaskProcessOomKilled,
    TaskProcessExitedWithNonZeroCode,
    TaskRunHeartbeatTimeout,
    TaskRunStalledExecuting,
    TaskRunDequeuedMaxRetries,
    TaskRunCrashed,
    MaxAttemptsExceeded,
    CouldNotFindTask,
    TaskInputError,
    TaskOutputError,
    RecursiveWaitDeadlock,
}

impl TaskRunErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskRunCancelled => "TASK_RUN_CANCELLED",
            Self::MaxDurationExceeded => "MAX_DURATION_EXCEEDED",
            Self::TaskProcessOomKilled => "TASK_PROCESS_OOM_KILLED",
            Self::TaskProcessExitedWithNonZeroCode => "TASK_PROCESS_EXITED_WITH_NON_ZERO_CODE",
            Self::TaskRunHeartbeatTimeout => "TASK_RUN_HEARTBEAT_TIMEOUT",
            Self::TaskRunStalledExecuting => "TASK_RUN_STALLED_EXECUTING",
            Self::TaskRunDequeuedMaxRetries => "TASK_RUN_DEQUEUED_MAX_RETRIES",
            Self::TaskRunCrashed => "TASK_RUN_CRASHED",
            Self::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            Self::CouldNotFindTask => "COULD_NOT_FIND_TASK",
            Self::TaskInputError => "TASK_INPUT_ERROR",
            Self::TaskOutputError => "TASK_OUTPUT_ERROR",
            Self::RecursiveWaitDeadlock => "RECURSIVE_WAIT_DEADLOCK",
        }
    }

    /// Failures that no amount of retrying will fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TaskProcessExitedWithNonZeroCode
                | Self::TaskRunHeartbeatTimeout
                | Self::TaskRunStalledExecuting
                | Self::TaskRunCrashed
                | Self::TaskProcessOomKilled
        )
    }

    /// Failures attributed to the platform rather than to the task.
    pub fn is_system_failure(&self) -> bool {
        matches!(
            self,
            Self::TaskRunHeartbeatTimeout
                | Self::TaskRunStalledExecuting
                | Self::TaskRunDequeuedMaxRetries
                | Self::TaskRunCrashed
                | Self::RecursiveWaitDeadlock
        )
    }
}

impl fmt::Display for TaskRunErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported for a failed attempt. This is data, not a Rust error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunError {
    BuiltInError {
        name: String,
        message: String,
        stack_trace: Option<String>,
    },
    CustomError {
        raw: String,
    },
    StringError {
        raw: String,
    },
    InternalError {
        code: TaskRunErrorCode,
        message: Option<String>,
        stack_trace: Option<String>,
    },
}

impl TaskRunError {
    pub fn internal(code: TaskRunErrorCode, message: impl Into<String>) -> Self {
        Self::InternalError {
            code,
            message: Some(message.into()),
            stack_trace: None,
        }
    }

    pub fn string(raw: impl Into<String>) -> Self {
        Self::StringError { raw: raw.into() }
    }

    pub fn internal_code(&self) -> Option<TaskRunErrorCode> {
        match self {
            Self::InternalError { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_oom(&self) -> bool {
        match self {
            Self::InternalError { code, .. } => *code == TaskRunErrorCode::TaskProcessOomKilled,
            Self::BuiltInError { name, message, .. } => {
                name == "OutOfMemoryError" || message.contains("JavaScript heap out of memory")
            }
            _ => false,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::BuiltInError { name, message, .. } => format!("{name}: {message}"),
            Self::CustomError { raw } | Self::StringError { raw } => raw.clone(),
            Self::InternalError { code, message, .. } => match message {
                Some(message) => format!("{code}: {message}"),
                None => code.to_string(),
            },
        }
    }
}

/// Retry decision made by the worker from the task's retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunExecutionRetry {
    pub timestamp: DateTime<Utc>,
    pub delay_ms: u64,
}

/// The outcome of one attempt, as reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ok")]
pub enum TaskRunExecutionResult {
    #[serde(rename = "true")]
    Success {
        output: Option<String>,
        output_type: Option<String>,
        metadata: Option<Value>,
    },
    #[serde(rename = "false")]
    Failure {
        error: TaskRunError,
        retry: Option<TaskRunExecutionRetry>,
        /// The worker decided not to retry regardless of attempts left
        skipped_retrying: bool,
        metadata: Option<Value>,
    },
}

impl TaskRunExecutionResult {
    pub fn success(output: Option<String>) -> Self {
        Self::Success {
            output,
            output_type: Some(crate::constants::JSON_OUTPUT_TYPE.to_string()),
            metadata: None,
        }
    }

    pub fn failure(error: TaskRunError, retry: Option<TaskRunExecutionRetry>) -> Self {
        Self::Failure {
            error,
            retry,
            skipped_retrying: false,
            metadata: None,
        }
    }

    pub fn metadata(&self) -> Option<&Value> {
        match self {
            Self::Success { metadata, .. } | Self::Failure { metadata, .. } => metadata.as_ref(),
        }
    }
}

/// Worker-side identity attached to snapshots it causes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: Option<String>,
    pub runner_id: Option<String>,
}

/// What a cancellation was asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRunRequest {
    pub run_id: Uuid,
    pub reason: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Finish immediately even if a worker still holds the run
    pub finalize_run: bool,
}

impl CancelRunRequest {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            reason: None,
            completed_at: None,
            finalize_run: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn finalize(mut self) -> Self {
        self.finalize_run = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serializes_with_type_tag() {
        let error = TaskRunError::internal(TaskRunErrorCode::TaskRunCancelled, "stop");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "INTERNAL_ERROR");
        assert_eq!(json["code"], "TASK_RUN_CANCELLED");
    }

    #[test]
    fn test_oom_detection() {
        assert!(TaskRunError::internal(TaskRunErrorCode::TaskProcessOomKilled, "oom").is_oom());
        assert!(TaskRunError::BuiltInError {
            name: "Error".into(),
            message: "FATAL ERROR: JavaScript heap out of memory".into(),
            stack_trace: None,
        }
        .is_oom());
        assert!(!TaskRunError::string("nope").is_oom());
    }

    #[test]
    fn test_completion_round_trip_tag() {
        let completion = TaskRunExecutionResult::success(Some("{\"a\":1}".into()));
        let json = serde_json::to_string(&completion).unwrap();
        let back: TaskRunExecutionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, completion);
    }
}
