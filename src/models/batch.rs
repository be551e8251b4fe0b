use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchTaskRunStatus {
    /// Items are still being triggered
    Processing,
    /// Every item was attempted; waiting for the created runs to finish
    Pending,
    /// Every item was attempted, some failed to create a run
    PartialFailed,
    /// No item produced a run and the batch was abandoned
    Aborted,
    Completed,
}

impl BatchTaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Pending => "PENDING",
            Self::PartialFailed => "PARTIAL_FAILED",
            Self::Aborted => "ABORTED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Aborted | Self::Completed)
    }

    /// All items have been attempted.
    pub fn is_sealed(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

impl fmt::Display for BatchTaskRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchTaskRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(Self::Processing),
            "PENDING" => Ok(Self::Pending),
            "PARTIAL_FAILED" => Ok(Self::PartialFailed),
            "ABORTED" => Ok(Self::Aborted),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTaskRun {
    pub id: Uuid,
    pub friendly_id: String,
    pub status: BatchTaskRunStatus,
    pub run_count: u32,
    /// Items attempted so far, successful or not
    pub processed_count: u32,
    pub successful_run_count: u32,
    pub failed_run_count: u32,
    pub run_ids: Vec<Uuid>,
    pub parent_run_id: Option<Uuid>,
    pub resume_parent_on_completion: bool,
    pub waitpoint_id: Option<Uuid>,
    pub runtime_environment_id: Uuid,
    pub project_id: Uuid,
    pub organization_id: Uuid,
    pub sealed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchTaskRun {
    pub fn all_items_processed(&self) -> bool {
        self.processed_count >= self.run_count
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchUpdate {
    pub status: Option<BatchTaskRunStatus>,
    pub successful_run_count: Option<u32>,
    pub failed_run_count: Option<u32>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchUpdate {
    pub fn apply_to(&self, batch: &mut BatchTaskRun, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            batch.status = status;
        }
        if let Some(count) = self.successful_run_count {
            batch.successful_run_count = count;
        }
        if let Some(count) = self.failed_run_count {
            batch.failed_run_count = count;
        }
        if let Some(sealed_at) = self.sealed_at {
            batch.sealed_at = Some(sealed_at);
        }
        if let Some(completed_at) = self.completed_at {
            batch.completed_at = Some(completed_at);
        }
        batch.updated_at = now;
    }
}

/// What happened to one batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchItemOutcome {
    Triggered { run_id: Uuid },
    Failed {
        error: String,
        error_code: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTaskRunItem {
    pub batch_id: Uuid,
    pub index: u32,
    pub outcome: BatchItemOutcome,
    pub created_at: DateTime<Utc>,
}

impl BatchTaskRunItem {
    pub fn run_id(&self) -> Option<Uuid> {
        match &self.outcome {
            BatchItemOutcome::Triggered { run_id } => Some(*run_id),
            BatchItemOutcome::Failed { .. } => None,
        }
    }
}
