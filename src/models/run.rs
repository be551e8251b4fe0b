use crate::retry::RetryOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::completion::TaskRunError;
use super::environment::RuntimeEnvironmentType;

/// Lifecycle status of a run as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunStatus {
    /// Waiting for its delay to elapse before being queued
    Delayed,
    /// Queued, waiting for capacity
    Pending,
    Executing,
    /// Executing but blocked on one or more waitpoints
    ExecutingWithWaitpoints,
    /// Last attempt failed, another attempt is scheduled
    RetryingAfterFailure,
    CompletedSuccessfully,
    CompletedWithErrors,
    Canceled,
    Expired,
    SystemFailure,
}

impl TaskRunStatus {
    /// Terminal statuses never change again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::CompletedSuccessfully
                | Self::CompletedWithErrors
                | Self::Canceled
                | Self::Expired
                | Self::SystemFailure
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::CompletedWithErrors | Self::Canceled | Self::Expired | Self::SystemFailure
        )
    }

    /// Statuses in which a run is waiting in (or about to enter) a queue.
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Delayed | Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delayed => "DELAYED",
            Self::Pending => "PENDING",
            Self::Executing => "EXECUTING",
            Self::ExecutingWithWaitpoints => "EXECUTING_WITH_WAITPOINTS",
            Self::RetryingAfterFailure => "RETRYING_AFTER_FAILURE",
            Self::CompletedSuccessfully => "COMPLETED_SUCCESSFULLY",
            Self::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
            Self::SystemFailure => "SYSTEM_FAILURE",
        }
    }
}

impl fmt::Display for TaskRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DELAYED" => Ok(Self::Delayed),
            "PENDING" => Ok(Self::Pending),
            "EXECUTING" => Ok(Self::Executing),
            "EXECUTING_WITH_WAITPOINTS" => Ok(Self::ExecutingWithWaitpoints),
            "RETRYING_AFTER_FAILURE" => Ok(Self::RetryingAfterFailure),
            "COMPLETED_SUCCESSFULLY" => Ok(Self::CompletedSuccessfully),
            "COMPLETED_WITH_ERRORS" => Ok(Self::CompletedWithErrors),
            "CANCELED" => Ok(Self::Canceled),
            "EXPIRED" => Ok(Self::Expired),
            "SYSTEM_FAILURE" => Ok(Self::SystemFailure),
            _ => Err(format!("Invalid task run status: {s}")),
        }
    }
}

/// A single unit of work and its execution bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub friendly_id: String,
    pub task_identifier: String,
    pub queue: String,
    pub concurrency_key: Option<String>,
    /// Worker pool (master queue) this run is dequeued from
    pub master_queue: String,
    pub status: TaskRunStatus,
    /// Number of attempts started so far
    pub attempt_number: u32,
    pub max_attempts: Option<u32>,
    pub retry_options: Option<RetryOptions>,
    pub machine_preset: Option<String>,

    pub payload: Value,
    pub payload_type: String,
    pub output: Option<Value>,
    pub output_type: Option<String>,
    pub error: Option<TaskRunError>,
    pub metadata: Option<Value>,

    pub runtime_environment_id: Uuid,
    pub environment_type: RuntimeEnvironmentType,
    pub project_id: Uuid,
    pub organization_id: Uuid,

    pub parent_task_run_id: Option<Uuid>,
    pub root_task_run_id: Option<Uuid>,
    pub depth: u32,
    pub batch_id: Option<Uuid>,
    pub batch_index: Option<u32>,
    pub resume_parent_on_completion: bool,
    /// Waitpoint representing this run's own completion, created lazily
    pub associated_waitpoint_id: Option<Uuid>,

    pub ttl_ms: Option<u64>,
    pub delay_until: Option<DateTime<Utc>>,
    pub debounce_key: Option<String>,
    /// Subtracted from the queue score; larger values are dequeued sooner
    pub priority_ms: i64,
    pub queue_timestamp: Option<DateTime<Utc>>,

    pub latest_snapshot_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// First attempt start
    pub started_at: Option<DateTime<Utc>>,
    /// Most recent attempt start
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    /// Attempts this run may use, bounded by [`crate::constants::MAX_TASK_RUN_ATTEMPTS`].
    pub fn effective_max_attempts(&self) -> u32 {
        let configured = self
            .max_attempts
            .or_else(|| self.retry_options.as_ref().map(|o| o.max_attempts))
            .unwrap_or(1)
            .max(1);
        configured.min(crate::constants::MAX_TASK_RUN_ATTEMPTS)
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

/// Partial update of a run row; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    pub status: Option<TaskRunStatus>,
    pub attempt_number: Option<u32>,
    pub machine_preset: Option<String>,
    pub output: Option<Value>,
    pub output_type: Option<String>,
    pub error: Option<TaskRunError>,
    pub metadata: Option<Value>,
    pub associated_waitpoint_id: Option<Uuid>,
    pub delay_until: Option<DateTime<Utc>>,
    pub queue_timestamp: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl RunUpdate {
    pub fn status(status: TaskRunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Apply this update to an in-memory copy of the run.
    pub fn apply_to(&self, run: &mut TaskRun, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(attempt_number) = self.attempt_number {
            run.attempt_number = attempt_number;
        }
        if let Some(machine) = &self.machine_preset {
            run.machine_preset = Some(machine.clone());
        }
        if let Some(output) = &self.output {
            run.output = Some(output.clone());
        }
        if let Some(output_type) = &self.output_type {
            run.output_type = Some(output_type.clone());
        }
        if let Some(error) = &self.error {
            run.error = Some(error.clone());
        }
        if let Some(metadata) = &self.metadata {
            run.metadata = Some(metadata.clone());
        }
        if let Some(waitpoint_id) = self.associated_waitpoint_id {
            run.associated_waitpoint_id = Some(waitpoint_id);
        }
        if let Some(delay_until) = self.delay_until {
            run.delay_until = Some(delay_until);
        }
        if let Some(queue_timestamp) = self.queue_timestamp {
            run.queue_timestamp = Some(queue_timestamp);
        }
        if let Some(started_at) = self.started_at {
            run.started_at.get_or_insert(started_at);
        }
        if let Some(executed_at) = self.executed_at {
            run.executed_at = Some(executed_at);
        }
        if let Some(completed_at) = self.completed_at {
            run.completed_at = Some(completed_at);
        }
        if let Some(expired_at) = self.expired_at {
            run.expired_at = Some(expired_at);
        }
        run.updated_at = now;
    }
}
