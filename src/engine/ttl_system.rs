//! Expires runs that were not picked up before their time-to-live elapsed.

use super::execution_snapshot_system::ExecutionSnapshotSystem;
use super::run_attempt_system::{RunAttemptSystem, RunFinish};
use super::resources::SystemResources;
use crate::error::EngineResult;
use crate::events::EngineEvent;
use crate::logging::log_run_operation;
use crate::models::{TaskRun, TaskRunError, TaskRunExecutionStatus, TaskRunStatus, WorkerIdentity};
use crate::store::StoreTransaction;
use crate::worker::EngineJob;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug)]
pub struct TtlSystem {
    resources: Arc<SystemResources>,
    snapshots: Arc<ExecutionSnapshotSystem>,
    attempts: Arc<RunAttemptSystem>,
}

impl TtlSystem {
    pub fn new(
        resources: Arc<SystemResources>,
        snapshots: Arc<ExecutionSnapshotSystem>,
        attempts: Arc<RunAttemptSystem>,
    ) -> Self {
        Self {
            resources,
            snapshots,
            attempts,
        }
    }

    /// Schedule the expiry job of a run that has a TTL. Starting an attempt
    /// acks it.
    pub fn stage_ttl(&self, tx: &mut StoreTransaction, run: &TaskRun) {
        if let Some(ttl_ms) = run.ttl_ms {
            let run_at = Utc::now() + chrono::Duration::milliseconds(ttl_ms as i64);
            tx.schedule_job(EngineJob::ExpireRun { run_id: run.id }, run_at);
        }
    }

    /// Expire a run that is still waiting to start. Runs that already
    /// started, or finished, are left alone.
    #[instrument(skip(self))]
    pub async fn expire_run(&self, run_id: Uuid) -> EngineResult<()> {
        let expired = self
            .resources
            .lock_run("expireRun", run_id, move || async move {
                let mut run = self.resources.get_run(run_id).await?;
                let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;

                let waiting = matches!(
                    latest.execution_status,
                    TaskRunExecutionStatus::RunCreated
                        | TaskRunExecutionStatus::Queued
                        | TaskRunExecutionStatus::Delayed
                );
                if run.is_final() || !waiting {
                    debug!(
                        run_id = %run_id,
                        execution_status = %latest.execution_status,
                        "Run is no longer waiting, skipping expiry"
                    );
                    return Ok(None);
                }

                let now = Utc::now();
                let ttl_ms = run.ttl_ms.unwrap_or_default();
                let error = TaskRunError::string(format!(
                    "Run expired because the TTL ({ttl_ms}ms) was reached"
                ));

                let mut tx = StoreTransaction::new();
                let snapshot = self.attempts.stage_finish_run(
                    &mut tx,
                    &mut run,
                    RunFinish::failed(
                        TaskRunStatus::Expired,
                        error,
                        "Run was expired because the TTL was reached",
                        now,
                    ),
                    &WorkerIdentity::default(),
                );
                tx.emit(EngineEvent::RunExpired {
                    run_id,
                    ttl_ms: run.ttl_ms,
                    expired_at: now,
                });
                self.resources.commit(tx).await?;

                log_run_operation("expireRun", run_id, Some(snapshot.id), run.status.as_str(), None);
                Ok(Some(run))
            })
            .await?;

        if let Some(run) = expired {
            self.attempts.after_run_finished(&run).await?;
        }
        Ok(())
    }
}
