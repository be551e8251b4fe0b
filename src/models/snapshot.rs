use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::environment::RuntimeEnvironmentType;
use super::run::TaskRunStatus;

/// Coordination state of a run, as opposed to its user-facing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunExecutionStatus {
    RunCreated,
    Delayed,
    Queued,
    /// Dequeued and handed to a worker that has not started the attempt yet
    PendingExecuting,
    Executing,
    ExecutingWithWaitpoints,
    /// Cancel requested while a worker holds the run
    PendingCancel,
    Finished,
}

impl TaskRunExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::Delayed => "DELAYED",
            Self::Queued => "QUEUED",
            Self::PendingExecuting => "PENDING_EXECUTING",
            Self::Executing => "EXECUTING",
            Self::ExecutingWithWaitpoints => "EXECUTING_WITH_WAITPOINTS",
            Self::PendingCancel => "PENDING_CANCEL",
            Self::Finished => "FINISHED",
        }
    }

    /// A worker currently holds the run.
    pub fn is_executing(&self) -> bool {
        matches!(
            self,
            Self::PendingExecuting | Self::Executing | Self::ExecutingWithWaitpoints
        )
    }

    /// The run may be popped off the queue and handed to a worker.
    pub fn is_dequeueable(&self) -> bool {
        matches!(self, Self::Queued)
    }

    /// Statuses that must be kept alive by worker heartbeats.
    pub fn requires_heartbeat(&self) -> bool {
        matches!(
            self,
            Self::PendingExecuting
                | Self::Executing
                | Self::ExecutingWithWaitpoints
                | Self::PendingCancel
        )
    }
}

impl fmt::Display for TaskRunExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskRunExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUN_CREATED" => Ok(Self::RunCreated),
            "DELAYED" => Ok(Self::Delayed),
            "QUEUED" => Ok(Self::Queued),
            "PENDING_EXECUTING" => Ok(Self::PendingExecuting),
            "EXECUTING" => Ok(Self::Executing),
            "EXECUTING_WITH_WAITPOINTS" => Ok(Self::ExecutingWithWaitpoints),
            "PENDING_CANCEL" => Ok(Self::PendingCancel),
            "FINISHED" => Ok(Self::Finished),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}

/// A waitpoint that had completed when a snapshot was taken, with its
/// position in a batch when it was part of one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedWaitpointRef {
    pub waitpoint_id: Uuid,
    pub batch_index: Option<u32>,
}

/// Immutable record of a run's coordination state. Snapshots form a chain
/// through `previous_snapshot_id`; the run row points at the latest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: Uuid,
    pub run_id: Uuid,
    pub execution_status: TaskRunExecutionStatus,
    pub description: String,
    pub run_status: TaskRunStatus,
    pub attempt_number: Option<u32>,
    pub previous_snapshot_id: Option<Uuid>,
    pub environment_id: Uuid,
    pub environment_type: RuntimeEnvironmentType,
    pub project_id: Uuid,
    pub organization_id: Uuid,
    pub completed_waitpoints: Vec<CompletedWaitpointRef>,
    pub batch_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub runner_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    pub fn completed_waitpoint_ids(&self) -> Vec<Uuid> {
        self.completed_waitpoints
            .iter()
            .map(|w| w.waitpoint_id)
            .collect()
    }
}
