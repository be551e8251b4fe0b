//! Descriptors handed to workers and callers by engine operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::environment::{MachinePreset, RuntimeEnvironmentType};
use super::run::{TaskRun, TaskRunStatus};
use super::snapshot::ExecutionSnapshot;
use super::waitpoint::CompletedWaitpoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptInfo {
    pub number: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: Uuid,
    pub friendly_id: String,
    pub payload: Value,
    pub payload_type: String,
    pub created_at: DateTime<Utc>,
    pub max_attempts: u32,
    pub metadata: Option<Value>,
    pub parent_task_run_id: Option<Uuid>,
    pub root_task_run_id: Option<Uuid>,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub concurrency_key: Option<String>,
    pub master_queue: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub id: Uuid,
    pub env_type: RuntimeEnvironmentType,
    pub project_id: Uuid,
    pub organization_id: Uuid,
}

impl EnvironmentInfo {
    pub fn from_run(run: &TaskRun) -> Self {
        Self {
            id: run.runtime_environment_id,
            env_type: run.environment_type,
            project_id: run.project_id,
            organization_id: run.organization_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub id: Uuid,
    pub index: Option<u32>,
}

/// Everything a worker needs to execute one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunExecution {
    pub task: TaskInfo,
    pub attempt: AttemptInfo,
    pub run: RunInfo,
    pub queue: QueueInfo,
    pub environment: EnvironmentInfo,
    pub machine: MachinePreset,
    pub batch: Option<BatchInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartRunAttemptResult {
    pub run: TaskRun,
    pub snapshot: ExecutionSnapshot,
    pub execution: TaskRunExecution,
}

/// How a completed attempt left the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    RunFinished,
    /// Nacked back into the queue for a cold restart
    RetryQueued,
    /// The same worker starts the next attempt in place
    RetryImmediately,
    RunPendingCancel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteRunAttemptResult {
    pub attempt_status: AttemptStatus,
    pub run: TaskRun,
    pub snapshot: ExecutionSnapshot,
}

/// Run plus the snapshot an operation left it in.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub run: TaskRun,
    pub snapshot: ExecutionSnapshot,
}

/// A run handed to a worker by the dequeue path.
#[derive(Debug, Clone, PartialEq)]
pub struct DequeuedMessage {
    pub run: TaskRun,
    pub snapshot: ExecutionSnapshot,
    pub environment: EnvironmentInfo,
    pub machine: MachinePreset,
    pub consumer_id: String,
    pub dequeued_at: DateTime<Utc>,
}

/// Read model for workers and presentation: latest state plus the outputs
/// of every waitpoint the latest snapshot resumed with.
#[derive(Debug, Clone, PartialEq)]
pub struct RunExecutionData {
    pub run_id: Uuid,
    pub friendly_id: String,
    pub run_status: TaskRunStatus,
    pub attempt_number: u32,
    pub snapshot: ExecutionSnapshot,
    pub completed_waitpoints: Vec<CompletedWaitpoint>,
    pub batch: Option<BatchInfo>,
}
