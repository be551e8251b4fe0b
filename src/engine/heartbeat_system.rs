//! # Heartbeats
//!
//! Every snapshot whose status needs a live worker gets a `HeartbeatSnapshot`
//! job when it is committed (see [`SystemResources::commit`]). Workers push
//! that job back with [`HeartbeatSystem::heartbeat_run`]. When it fires the
//! run is recovered according to where it got stuck:
//!
//! | Status | Recovery |
//! |---|---|
//! | PENDING_EXECUTING | requeue, failing the run if the queue refuses |
//! | EXECUTING, EXECUTING_WITH_WAITPOINTS | failed attempt, retried cold |
//! | PENDING_CANCEL | cancellation is finalized |

use super::execution_snapshot_system::ExecutionSnapshotSystem;
use super::run_attempt_system::{AttemptFailure, RunAttemptSystem};
use super::resources::SystemResources;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ExecutionSnapshot, TaskRunError, TaskRunErrorCode, TaskRunExecutionStatus, WorkerIdentity,
};
use crate::worker::EngineJob;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct HeartbeatSystem {
    resources: Arc<SystemResources>,
    snapshots: Arc<ExecutionSnapshotSystem>,
    attempts: Arc<RunAttemptSystem>,
}

impl HeartbeatSystem {
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

    /// Push back the heartbeat deadline of the caller's snapshot.
    #[instrument(skip(self))]
    pub async fn heartbeat_run(&self, run_id: Uuid, snapshot_id: Uuid) -> EngineResult<ExecutionSnapshot> {
        let latest = self.snapshots.assert_latest(run_id, snapshot_id).await?;
        let Some(timeout) = self.resources.heartbeat_timeout(latest.execution_status) else {
            return Err(EngineError::invalid_state(
                run_id,
                latest.execution_status,
                "heartbeatRun",
            ));
        };
        self.resources
            .jobs
            .schedule(
                EngineJob::HeartbeatSnapshot {
                    run_id,
                    snapshot_id,
                },
                Utc::now() + timeout,
            )
            .await?;
        debug!(run_id = %run_id, snapshot_id = %snapshot_id, "Heartbeat received");
        Ok(latest)
    }

    #[instrument(skip(self))]
    pub async fn handle_heartbeat_timeout(&self, run_id: Uuid, snapshot_id: Uuid) -> EngineResult<()> {
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        if latest.id != snapshot_id {
            debug!(run_id = %run_id, snapshot_id = %snapshot_id, "Stale heartbeat timeout, ignoring");
            return Ok(());
        }

        warn!(
            run_id = %run_id,
            execution_status = %latest.execution_status,
            "Heartbeat timed out"
        );
        let outcome = match latest.execution_status {
            TaskRunExecutionStatus::PendingExecuting => self
                .attempts
                .try_nack_and_requeue(
                    run_id,
                    Some(snapshot_id),
                    TaskRunError::internal(
                        TaskRunErrorCode::TaskRunHeartbeatTimeout,
                        "Worker did not start the run before the heartbeat timed out",
                    ),
                )
                .await
                .map(|_| ()),
            TaskRunExecutionStatus::Executing | TaskRunExecutionStatus::ExecutingWithWaitpoints => {
                let failure = AttemptFailure::new(TaskRunError::internal(
                    TaskRunErrorCode::TaskRunStalledExecuting,
                    "Run stopped sending heartbeats while executing",
                ));
                self.attempts
                    .attempt_failed(run_id, snapshot_id, failure, WorkerIdentity::default(), true)
                    .await
                    .map(|_| ())
            }
            TaskRunExecutionStatus::PendingCancel => self
                .attempts
                .finalize_cancel_if_pending(run_id, snapshot_id)
                .await
                .map(|_| ()),
            other => {
                debug!(run_id = %run_id, execution_status = %other, "No heartbeat recovery for status");
                Ok(())
            }
        };

        match outcome {
            // The run moved on while the timeout was being handled.
            Err(EngineError::SnapshotConflict { .. }) => Ok(()),
            other => other,
        }
    }
}
