//! Durable storage of scheduled engine jobs.
//!
//! Jobs live in the queue backend as a sorted set scored by due time plus
//! one payload key per job id. Claiming a job pushes its score out by the
//! visibility timeout, so a job claimed by a crashed process becomes due
//! again instead of being lost.

use super::job::{EngineJob, JobAction, ScheduledJob};
use crate::error::EngineResult;
use crate::run_queue::{KeyProducer, QueueBackend};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// A job handed out by [`JobScheduler::claim_due`], with the exact payload
/// that was claimed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub scheduled: ScheduledJob,
    raw: String,
}

impl ClaimedJob {
    pub fn job(&self) -> &EngineJob {
        &self.scheduled.job
    }
}

#[derive(Debug, Clone)]
pub struct JobScheduler {
    backend: QueueBackend,
    keys: KeyProducer,
    visibility_timeout: Duration,
}

impl JobScheduler {
    pub fn new(backend: QueueBackend, keys: KeyProducer, visibility_timeout: Duration) -> Self {
        Self {
            backend,
            keys,
            visibility_timeout,
        }
    }

    /// Schedule a job, replacing any pending job with the same id.
    pub async fn schedule(&self, job: EngineJob, run_at: DateTime<Utc>) -> EngineResult<()> {
        let scheduled = ScheduledJob::new(job);
        let payload = serde_json::to_string(&scheduled)?;
        self.backend
            .schedule_job(
                &self.keys.jobs_key(),
                &self.keys.job_payload_key(&scheduled.id),
                &scheduled.id,
                &payload,
                run_at.timestamp_millis(),
            )
            .await?;
        debug!(job_id = %scheduled.id, run_at = %run_at, "Scheduled job");
        Ok(())
    }

    /// Remove a pending job. Acking an unknown job is a no-op.
    pub async fn ack(&self, job_id: &str) -> EngineResult<()> {
        self.backend
            .delete_job(&self.keys.jobs_key(), &self.keys.job_payload_key(job_id), job_id)
            .await
    }

    /// Apply job actions released by a committed transaction, in order.
    pub async fn apply(&self, actions: Vec<JobAction>) -> EngineResult<()> {
        for action in actions {
            match action {
                JobAction::Schedule { job, run_at } => self.schedule(job, run_at).await?,
                JobAction::Ack { job_id } => self.ack(&job_id).await?,
            }
        }
        Ok(())
    }

    /// Claim up to `limit` jobs due at `now`.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<ClaimedJob>> {
        let now_ms = now.timestamp_millis();
        let visible_again_ms = now_ms + self.visibility_timeout.as_millis() as i64;
        let claimed = self
            .backend
            .claim_due_jobs(
                &self.keys.jobs_key(),
                &self.keys.job_payload_key(""),
                now_ms,
                limit,
                visible_again_ms,
            )
            .await?;

        let mut jobs = Vec::with_capacity(claimed.len());
        for (job_id, raw) in claimed {
            match serde_json::from_str::<ScheduledJob>(&raw) {
                Ok(scheduled) => jobs.push(ClaimedJob { scheduled, raw }),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Dropping undecodable job");
                    self.ack(&job_id).await?;
                }
            }
        }
        Ok(jobs)
    }

    /// Remove a finished job unless it was rescheduled meanwhile.
    pub async fn complete(&self, claimed: &ClaimedJob) -> EngineResult<bool> {
        self.backend
            .settle_job(
                &self.keys.jobs_key(),
                &self.keys.job_payload_key(&claimed.scheduled.id),
                &claimed.scheduled.id,
                &claimed.raw,
                None,
            )
            .await
    }

    /// Reschedule a failed job as its next attempt, unless it was replaced
    /// meanwhile.
    pub async fn retry(&self, claimed: &ClaimedJob, run_at: DateTime<Utc>) -> EngineResult<bool> {
        let next = serde_json::to_string(&claimed.scheduled.next_attempt())?;
        self.backend
            .settle_job(
                &self.keys.jobs_key(),
                &self.keys.job_payload_key(&claimed.scheduled.id),
                &claimed.scheduled.id,
                &claimed.raw,
                Some((&next, run_at.timestamp_millis())),
            )
            .await
    }

    /// Pending job ids with their due time in epoch milliseconds.
    pub async fn pending(&self) -> EngineResult<Vec<(String, i64)>> {
        self.backend
            .zrange_with_scores(&self.keys.jobs_key(), 0, usize::MAX)
            .await
    }

    pub async fn find(&self, job_id: &str) -> EngineResult<Option<ScheduledJob>> {
        let Some(raw) = self.backend.get(&self.keys.job_payload_key(job_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scheduler() -> JobScheduler {
        JobScheduler::new(
            QueueBackend::memory(),
            KeyProducer::new("test:"),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_only_due_jobs_are_claimed() {
        let scheduler = scheduler();
        let now = Utc::now();
        let due = EngineJob::ExpireRun { run_id: Uuid::now_v7() };
        let later = EngineJob::ExpireRun { run_id: Uuid::now_v7() };
        scheduler.schedule(due.clone(), now).await.unwrap();
        scheduler
            .schedule(later, now + chrono::Duration::minutes(5))
            .await
            .unwrap();

        let claimed = scheduler.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job(), &due);

        // Claimed jobs are invisible until the visibility timeout passes.
        assert!(scheduler.claim_due(now, 10).await.unwrap().is_empty());
        let redelivered = scheduler
            .claim_due(now + chrono::Duration::seconds(31), 10)
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_does_not_remove_rescheduled_job() {
        let scheduler = scheduler();
        let run_id = Uuid::now_v7();
        let now = Utc::now();
        scheduler
            .schedule(EngineJob::HeartbeatSnapshot { run_id, snapshot_id: Uuid::now_v7() }, now)
            .await
            .unwrap();
        let claimed = scheduler.claim_due(now, 1).await.unwrap().remove(0);

        let replacement = EngineJob::HeartbeatSnapshot { run_id, snapshot_id: Uuid::now_v7() };
        scheduler
            .schedule(replacement.clone(), now + chrono::Duration::minutes(1))
            .await
            .unwrap();

        assert!(!scheduler.complete(&claimed).await.unwrap());
        let stored = scheduler.find(&claimed.scheduled.id).await.unwrap().unwrap();
        assert_eq!(stored.job, replacement);
    }

    #[tokio::test]
    async fn test_retry_bumps_attempt() {
        let scheduler = scheduler();
        let now = Utc::now();
        scheduler
            .schedule(EngineJob::TryCompleteBatch { batch_id: Uuid::now_v7() }, now)
            .await
            .unwrap();
        let claimed = scheduler.claim_due(now, 1).await.unwrap().remove(0);

        assert!(scheduler.retry(&claimed, now).await.unwrap());
        let again = scheduler.claim_due(now, 1).await.unwrap().remove(0);
        assert_eq!(again.scheduled.attempt, 1);
        assert!(scheduler.complete(&again).await.unwrap());
        assert!(scheduler.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_runs_actions_in_order() {
        let scheduler = scheduler();
        let job = EngineJob::EnqueueDelayedRun { run_id: Uuid::now_v7() };
        scheduler
            .apply(vec![
                JobAction::Schedule { job: job.clone(), run_at: Utc::now() },
                JobAction::Ack { job_id: job.id() },
            ])
            .await
            .unwrap();
        assert!(scheduler.pending().await.unwrap().is_empty());
    }
}
