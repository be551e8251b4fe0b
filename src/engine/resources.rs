//! # System Resources
//!
//! The collaborators every engine system shares: the transactional store,
//! the run queue, the run lock, the job scheduler and the event bus.
//!
//! [`SystemResources::commit`] is the only way systems persist changes. It
//! commits the staged writes, then releases the transaction's side effects
//! in a fixed order: snapshot events, heartbeat bookkeeping for the newest
//! snapshot of each run, job actions, and finally domain events.

use crate::config::EngineConfig;
use crate::constants::JSON_OUTPUT_TYPE;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventPublisher};
use crate::locking::RunLocker;
use crate::logging::log_error;
use crate::models::{
    AuthenticatedEnvironment, ExecutionSnapshot, RunUpdate, TaskRun, TaskRunExecutionStatus,
};
use crate::run_queue::RunQueue;
use crate::store::{EngineStore, StoreTransaction};
use crate::worker::{job_id, EngineJob, JobAction, JobScheduler};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct SystemResources {
    pub store: Arc<dyn EngineStore>,
    pub run_queue: RunQueue,
    pub run_lock: RunLocker,
    pub jobs: JobScheduler,
    pub events: EventPublisher,
    pub config: Arc<EngineConfig>,
}

impl SystemResources {
    pub fn new(
        store: Arc<dyn EngineStore>,
        run_queue: RunQueue,
        run_lock: RunLocker,
        jobs: JobScheduler,
        events: EventPublisher,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            run_queue,
            run_lock,
            jobs,
            events,
            config,
        }
    }

    /// Load a run or fail with [`EngineError::RunNotFound`].
    pub async fn get_run(&self, run_id: Uuid) -> EngineResult<TaskRun> {
        self.store
            .find_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound { run_id })
    }

    /// Run `f` under the lock of a single run.
    pub async fn lock_run<F, Fut, T>(&self, operation: &str, run_id: Uuid, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.run_lock.lock(operation, &[run_id], None, f).await
    }

    /// How long a snapshot in `status` may go without a heartbeat.
    pub fn heartbeat_timeout(&self, status: TaskRunExecutionStatus) -> Option<chrono::Duration> {
        let heartbeat = &self.config.heartbeat;
        let ms = match status {
            TaskRunExecutionStatus::PendingExecuting => heartbeat.pending_executing_ms,
            TaskRunExecutionStatus::Executing => heartbeat.executing_ms,
            TaskRunExecutionStatus::ExecutingWithWaitpoints => heartbeat.executing_with_waitpoints_ms,
            TaskRunExecutionStatus::PendingCancel => heartbeat.pending_cancel_ms,
            _ => return None,
        };
        Some(chrono::Duration::milliseconds(ms as i64))
    }

    /// Commit a transaction and release its side effects.
    ///
    /// Side effects after a successful commit are best effort: a failure to
    /// schedule a job is logged, never reported as a failed commit.
    pub async fn commit(&self, tx: StoreTransaction) -> EngineResult<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let parts = tx.into_parts();
        if !parts.writes.is_empty() {
            self.store.commit(parts.writes).await?;
        }

        let now = Utc::now();
        let mut latest_per_run: HashMap<Uuid, &ExecutionSnapshot> = HashMap::new();
        for snapshot in &parts.created_snapshots {
            latest_per_run.insert(snapshot.run_id, snapshot);
        }

        let mut jobs = parts.jobs;
        for snapshot in latest_per_run.values() {
            let heartbeat = EngineJob::HeartbeatSnapshot {
                run_id: snapshot.run_id,
                snapshot_id: snapshot.id,
            };
            match self.heartbeat_timeout(snapshot.execution_status) {
                Some(timeout) => jobs.push(JobAction::Schedule {
                    job: heartbeat,
                    run_at: now + timeout,
                }),
                None => jobs.push(JobAction::Ack {
                    job_id: heartbeat.id(),
                }),
            }
        }

        if let Err(e) = self.jobs.apply(jobs).await {
            log_error(
                "SystemResources",
                "commit",
                &e.to_string(),
                Some("Failed to apply job actions after commit"),
            );
        }

        for snapshot in parts.created_snapshots {
            debug!(
                run_id = %snapshot.run_id,
                snapshot_id = %snapshot.id,
                execution_status = %snapshot.execution_status,
                "Execution snapshot created"
            );
            self.events
                .publish(EngineEvent::ExecutionSnapshotCreated { snapshot });
        }
        for event in parts.events {
            self.events.publish(event);
        }
        Ok(())
    }
}

/// Stage a run update and mirror it onto the caller's copy of the run.
pub(crate) fn stage_run_update(
    tx: &mut StoreTransaction,
    run: &mut TaskRun,
    update: RunUpdate,
    now: DateTime<Utc>,
) {
    update.apply_to(run, now);
    tx.update_run(run.id, update);
}

/// Environment descriptor for a run, as the queue needs it.
pub(crate) fn environment_of(run: &TaskRun) -> AuthenticatedEnvironment {
    AuthenticatedEnvironment {
        id: run.runtime_environment_id,
        env_type: run.environment_type,
        project_id: run.project_id,
        organization_id: run.organization_id,
        maximum_concurrency_limit: None,
    }
}

/// Parse a serialized output into the value stored on the run.
pub(crate) fn output_value(output: Option<&str>, output_type: Option<&str>) -> Option<Value> {
    let raw = output?;
    if output_type.unwrap_or(JSON_OUTPUT_TYPE) == JSON_OUTPUT_TYPE {
        if let Ok(value) = serde_json::from_str(raw) {
            return Some(value);
        }
    }
    Some(Value::String(raw.to_string()))
}

/// Serialize a run's stored output back into waitpoint form.
pub(crate) fn output_string(run: &TaskRun) -> Option<String> {
    let is_json = run.output_type.as_deref().unwrap_or(JSON_OUTPUT_TYPE) == JSON_OUTPUT_TYPE;
    match &run.output {
        Some(Value::String(s)) if !is_json => Some(s.clone()),
        Some(value) => Some(value.to_string()),
        None => None,
    }
}

pub(crate) fn expire_job_id(run_id: &Uuid) -> String {
    job_id(crate::constants::jobs::EXPIRE_RUN, run_id)
}

pub(crate) fn delayed_job_id(run_id: &Uuid) -> String {
    job_id(crate::constants::jobs::ENQUEUE_DELAYED_RUN, run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_output_is_parsed() {
        assert_eq!(
            output_value(Some("{\"a\":1}"), None),
            Some(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            output_value(Some("plain"), Some("text/plain")),
            Some(Value::String("plain".into()))
        );
        assert_eq!(
            output_value(Some("not json"), Some(JSON_OUTPUT_TYPE)),
            Some(Value::String("not json".into()))
        );
        assert_eq!(output_value(None, None), None);
    }
}
