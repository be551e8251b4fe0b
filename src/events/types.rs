use crate::constants::events;
use crate::models::{
    ExecutionSnapshot, TaskRunError, TaskRunExecutionStatus, TaskRunStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Domain events emitted after a state change has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    RunAttemptStarted {
        run_id: Uuid,
        attempt_number: u32,
        environment_id: Uuid,
        started_at: DateTime<Utc>,
    },
    RunSucceeded {
        run_id: Uuid,
        output: Option<String>,
        output_type: Option<String>,
        completed_at: DateTime<Utc>,
    },
    RunFailed {
        run_id: Uuid,
        status: TaskRunStatus,
        error: TaskRunError,
        completed_at: DateTime<Utc>,
    },
    RunCancelled {
        run_id: Uuid,
        reason: Option<String>,
        completed_at: DateTime<Utc>,
    },
    RunRetryScheduled {
        run_id: Uuid,
        attempt_number: u32,
        retry_at: DateTime<Utc>,
        delay_ms: u64,
        machine: Option<String>,
    },
    RunExpired {
        run_id: Uuid,
        ttl_ms: Option<u64>,
        expired_at: DateTime<Utc>,
    },
    RunDelayRescheduled {
        run_id: Uuid,
        delay_until: DateTime<Utc>,
    },
    ExecutionSnapshotCreated {
        snapshot: ExecutionSnapshot,
    },
    RunMetadataUpdated {
        run_id: Uuid,
        metadata: Value,
    },
    /// Tells the worker holding a run to re-read its execution data
    WorkerNotification {
        run_id: Uuid,
        snapshot_id: Uuid,
        execution_status: TaskRunExecutionStatus,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunAttemptStarted { .. } => events::RUN_ATTEMPT_STARTED,
            Self::RunSucceeded { .. } => events::RUN_SUCCEEDED,
            Self::RunFailed { .. } => events::RUN_FAILED,
            Self::RunCancelled { .. } => events::RUN_CANCELLED,
            Self::RunRetryScheduled { .. } => events::RUN_RETRY_SCHEDULED,
            Self::RunExpired { .. } => events::RUN_EXPIRED,
            Self::RunDelayRescheduled { .. } => events::RUN_DELAY_RESCHEDULED,
            Self::ExecutionSnapshotCreated { .. } => events::EXECUTION_SNAPSHOT_CREATED,
            Self::RunMetadataUpdated { .. } => events::RUN_METADATA_UPDATED,
            Self::WorkerNotification { .. } => events::WORKER_NOTIFICATION,
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunAttemptStarted { run_id, .. }
            | Self::RunSucceeded { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. }
            | Self::RunRetryScheduled { run_id, .. }
            | Self::RunExpired { run_id, .. }
            | Self::RunDelayRescheduled { run_id, .. }
            | Self::RunMetadataUpdated { run_id, .. }
            | Self::WorkerNotification { run_id, .. } => *run_id,
            Self::ExecutionSnapshotCreated { snapshot } => snapshot.run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_matches_name() {
        let event = EngineEvent::RunDelayRescheduled {
            run_id: Uuid::now_v7(),
            delay_until: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
    }
}
