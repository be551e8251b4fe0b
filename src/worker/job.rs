use crate::constants::jobs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Deferred engine work. Each job has a stable id, so scheduling the same
/// job again replaces the pending one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineJob {
    ContinueRunIfUnblocked {
        run_id: Uuid,
    },
    CancelRun {
        run_id: Uuid,
        reason: Option<String>,
        completed_at: DateTime<Utc>,
        finalize_run: bool,
    },
    TryCompleteBatch {
        batch_id: Uuid,
    },
    EnqueueDelayedRun {
        run_id: Uuid,
    },
    ExpireRun {
        run_id: Uuid,
    },
    HeartbeatSnapshot {
        run_id: Uuid,
        snapshot_id: Uuid,
    },
    FinishDateTimeWaitpoint {
        waitpoint_id: Uuid,
    },
}

impl EngineJob {
    pub fn id(&self) -> String {
        match self {
            Self::ContinueRunIfUnblocked { run_id } => job_id(jobs::CONTINUE_RUN_IF_UNBLOCKED, run_id),
            Self::CancelRun { run_id, .. } => job_id(jobs::CANCEL_RUN, run_id),
            Self::TryCompleteBatch { batch_id } => job_id(jobs::TRY_COMPLETE_BATCH, batch_id),
            Self::EnqueueDelayedRun { run_id } => job_id(jobs::ENQUEUE_DELAYED_RUN, run_id),
            Self::ExpireRun { run_id } => job_id(jobs::EXPIRE_RUN, run_id),
            Self::HeartbeatSnapshot { run_id, .. } => job_id(jobs::HEARTBEAT_SNAPSHOT, run_id),
            Self::FinishDateTimeWaitpoint { waitpoint_id } => {
                job_id(jobs::FINISH_WAITPOINT, waitpoint_id)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContinueRunIfUnblocked { .. } => jobs::CONTINUE_RUN_IF_UNBLOCKED,
            Self::CancelRun { .. } => jobs::CANCEL_RUN,
            Self::TryCompleteBatch { .. } => jobs::TRY_COMPLETE_BATCH,
            Self::EnqueueDelayedRun { .. } => jobs::ENQUEUE_DELAYED_RUN,
            Self::ExpireRun { .. } => jobs::EXPIRE_RUN,
            Self::HeartbeatSnapshot { .. } => jobs::HEARTBEAT_SNAPSHOT,
            Self::FinishDateTimeWaitpoint { .. } => jobs::FINISH_WAITPOINT,
        }
    }
}

pub fn job_id(kind: &str, subject: &Uuid) -> String {
    format!("{kind}:{subject}")
}

/// Stored form of a scheduled job. The token changes on every schedule, so a
/// worker finishing an old copy never removes a newer one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub token: Uuid,
    pub attempt: u32,
    pub job: EngineJob,
}

impl ScheduledJob {
    pub fn new(job: EngineJob) -> Self {
        Self {
            id: job.id(),
            token: Uuid::new_v4(),
            attempt: 0,
            job,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            id: self.id.clone(),
            token: Uuid::new_v4(),
            attempt: self.attempt + 1,
            job: self.job.clone(),
        }
    }
}

/// A job operation carried by a store transaction and applied after commit.
#[derive(Debug, Clone, PartialEq)]
pub enum JobAction {
    Schedule {
        job: EngineJob,
        run_at: DateTime<Utc>,
    },
    Ack {
        job_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_stable_per_subject() {
        let run_id = Uuid::now_v7();
        let first = EngineJob::HeartbeatSnapshot {
            run_id,
            snapshot_id: Uuid::now_v7(),
        };
        let second = EngineJob::HeartbeatSnapshot {
            run_id,
            snapshot_id: Uuid::now_v7(),
        };
        assert_eq!(first.id(), second.id());
        assert_eq!(first.id(), format!("heartbeatSnapshot:{run_id}"));
    }

    #[test]
    fn test_rescheduling_changes_token() {
        let job = ScheduledJob::new(EngineJob::ExpireRun {
            run_id: Uuid::now_v7(),
        });
        let retry = job.next_attempt();
        assert_eq!(retry.id, job.id);
        assert_eq!(retry.attempt, 1);
        assert_ne!(retry.token, job.token);
    }
}
