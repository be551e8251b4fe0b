use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitpointType {
    /// Completed when a run finishes
    Run,
    /// Completed when every run of a batch finishes
    Batch,
    /// Completed when a point in time passes
    Datetime,
    /// Completed explicitly by a caller
    Manual,
}

impl WaitpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::Batch => "BATCH",
            Self::Datetime => "DATETIME",
            Self::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for WaitpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WaitpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUN" => Ok(Self::Run),
            "BATCH" => Ok(Self::Batch),
            "DATETIME" => Ok(Self::Datetime),
            "MANUAL" => Ok(Self::Manual),
            _ => Err(format!("Invalid waitpoint type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitpointStatus {
    Pending,
    Completed,
}

impl WaitpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for WaitpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WaitpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(format!("Invalid waitpoint status: {s}")),
        }
    }
}

/// A resolvable future that runs can block on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waitpoint {
    pub id: Uuid,
    pub friendly_id: String,
    pub kind: WaitpointType,
    pub status: WaitpointStatus,
    pub idempotency_key: String,
    pub user_provided_idempotency_key: bool,
    pub output: Option<String>,
    pub output_type: String,
    pub output_is_error: bool,
    pub completed_by_task_run_id: Option<Uuid>,
    pub completed_by_batch_id: Option<Uuid>,
    /// For DATETIME waitpoints, the instant at which they complete
    pub completed_after: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Waitpoint {
    pub fn is_completed(&self) -> bool {
        self.status == WaitpointStatus::Completed
    }
}

/// Result value delivered when a waitpoint completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitpointOutput {
    pub value: Option<String>,
    pub output_type: Option<String>,
    pub is_error: bool,
}

impl WaitpointOutput {
    pub fn success(value: Option<String>, output_type: Option<String>) -> Self {
        Self {
            value,
            output_type,
            is_error: false,
        }
    }

    pub fn error(value: String) -> Self {
        Self {
            value: Some(value),
            output_type: Some(crate::constants::JSON_OUTPUT_TYPE.to_string()),
            is_error: true,
        }
    }
}

/// Join row: `task_run_id` is blocked by `waitpoint_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunWaitpoint {
    pub id: Uuid,
    pub task_run_id: Uuid,
    pub waitpoint_id: Uuid,
    pub project_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub batch_index: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl TaskRunWaitpoint {
    /// Identity used for idempotent insertion.
    pub fn dedupe_key(&self) -> (Uuid, Uuid, Option<u32>) {
        (self.task_run_id, self.waitpoint_id, self.batch_index)
    }
}

/// A blocking relation together with the waitpoint it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockingWaitpoint {
    pub relation: TaskRunWaitpoint,
    pub waitpoint: Waitpoint,
}

/// A completed waitpoint as seen by a resumed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedWaitpoint {
    pub id: Uuid,
    pub friendly_id: String,
    pub kind: WaitpointType,
    pub index: Option<u32>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by_task_run_id: Option<Uuid>,
    pub completed_by_batch_id: Option<Uuid>,
    pub output: Option<String>,
    pub output_type: String,
    pub output_is_error: bool,
}

impl CompletedWaitpoint {
    pub fn from_waitpoint(waitpoint: &Waitpoint, index: Option<u32>) -> Self {
        Self {
            id: waitpoint.id,
            friendly_id: waitpoint.friendly_id.clone(),
            kind: waitpoint.kind,
            index,
            completed_at: waitpoint.completed_at,
            completed_by_task_run_id: waitpoint.completed_by_task_run_id,
            completed_by_batch_id: waitpoint.completed_by_batch_id,
            output: waitpoint.output.clone(),
            output_type: waitpoint.output_type.clone(),
            output_is_error: waitpoint.output_is_error,
        }
    }
}
