//! Runs triggered with a future start time wait in DELAYED until their
//! `EnqueueDelayedRun` job fires.

use super::enqueue_system::EnqueueSystem;
use super::execution_snapshot_system::{ExecutionSnapshotSystem, SnapshotInput};
use super::resources::{stage_run_update, SystemResources};
use super::ttl_system::TtlSystem;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::logging::log_run_operation;
use crate::models::{
    ExecutionResult, ExecutionSnapshot, RunUpdate, TaskRun, TaskRunExecutionStatus, TaskRunStatus,
};
use crate::store::StoreTransaction;
use crate::worker::EngineJob;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug)]
pub struct DelayedRunSystem {
    resources: Arc<SystemResources>,
    snapshots: Arc<ExecutionSnapshotSystem>,
    enqueue: Arc<EnqueueSystem>,
    ttl: Arc<TtlSystem>,
}

impl DelayedRunSystem {
    pub fn new(
        resources: Arc<SystemResources>,
        snapshots: Arc<ExecutionSnapshotSystem>,
        enqueue: Arc<EnqueueSystem>,
        ttl: Arc<TtlSystem>,
    ) -> Self {
        Self {
            resources,
            snapshots,
            enqueue,
            ttl,
        }
    }

    /// Stage the DELAYED snapshot and the job that will enqueue the run.
    pub fn stage_delay(
        &self,
        tx: &mut StoreTransaction,
        run: &mut TaskRun,
        delay_until: DateTime<Utc>,
        description: &str,
    ) -> ExecutionSnapshot {
        let snapshot = self.snapshots.create_execution_snapshot(
            tx,
            run,
            SnapshotInput::new(TaskRunExecutionStatus::Delayed, description),
        );
        tx.schedule_job(EngineJob::EnqueueDelayedRun { run_id: run.id }, delay_until);
        snapshot
    }

    /// Move a DELAYED run into its queue. A run that is no longer delayed
    /// is left untouched.
    #[instrument(skip(self))]
    pub async fn enqueue_delayed_run(&self, run_id: Uuid) -> EngineResult<()> {
        self.resources
            .lock_run("enqueueDelayedRun", run_id, move || async move {
                let mut run = self.resources.get_run(run_id).await?;
                let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
                if run.status != TaskRunStatus::Delayed
                    || latest.execution_status != TaskRunExecutionStatus::Delayed
                {
                    debug!(run_id = %run_id, status = %run.status, "Run is no longer delayed");
                    return Ok(());
                }

                let now = Utc::now();
                let mut tx = StoreTransaction::new();
                stage_run_update(
                    &mut tx,
                    &mut run,
                    RunUpdate {
                        status: Some(TaskRunStatus::Pending),
                        queue_timestamp: Some(now),
                        ..Default::default()
                    },
                    now,
                );
                let snapshot =
                    self.enqueue
                        .stage_enqueue(&mut tx, &mut run, "Run was enqueued after its delay");
                self.ttl.stage_ttl(&mut tx, &run);
                self.resources.commit(tx).await?;
                self.enqueue.enqueue_run(&run).await?;

                log_run_operation("enqueueDelayedRun", run_id, Some(snapshot.id), "QUEUED", None);
                Ok(())
            })
            .await
    }

    /// Push a DELAYED run's start time to `delay_until`.
    #[instrument(skip(self))]
    pub async fn reschedule_delayed_run(
        &self,
        run_id: Uuid,
        delay_until: DateTime<Utc>,
    ) -> EngineResult<ExecutionResult> {
        self.resources
            .lock_run("rescheduleDelayedRun", run_id, move || async move {
                let mut run = self.resources.get_run(run_id).await?;
                if run.status != TaskRunStatus::Delayed {
                    return Err(EngineError::invalid_state(
                        run_id,
                        run.status,
                        "rescheduleDelayedRun",
                    ));
                }

                let now = Utc::now();
                let mut tx = StoreTransaction::new();
                stage_run_update(
                    &mut tx,
                    &mut run,
                    RunUpdate {
                        delay_until: Some(delay_until),
                        ..Default::default()
                    },
                    now,
                );
                let snapshot =
                    self.stage_delay(&mut tx, &mut run, delay_until, "Delayed run was rescheduled");
                tx.emit(EngineEvent::RunDelayRescheduled {
                    run_id,
                    delay_until,
                });
                self.resources.commit(tx).await?;
                Ok(ExecutionResult { run, snapshot })
            })
            .await
    }
}
