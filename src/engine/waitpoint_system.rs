//! # Waitpoint System
//!
//! Waitpoints are resolvable futures that runs block on: another run's
//! completion, a whole batch, a point in time, or an explicit call.
//!
//! ## Blocking and resuming
//!
//! Blocking adds join rows and moves the run to EXECUTING_WITH_WAITPOINTS.
//! Completing a waitpoint fans out to every run it blocks; a run whose
//! blockers are all complete returns to EXECUTING with a snapshot listing
//! the waitpoints it resumed with. Run waitpoints are created lazily, only
//! when something asks to wait on the run.

use super::execution_snapshot_system::{ExecutionSnapshotSystem, SnapshotInput};
use super::release_concurrency_system::ReleaseConcurrencySystem;
use super::resources::{output_string, stage_run_update, SystemResources};
use crate::constants::JSON_OUTPUT_TYPE;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::logging::log_run_operation;
use crate::models::{
    generate_friendly_id, AuthenticatedEnvironment, BatchInfo, CompletedWaitpointRef,
    ExecutionSnapshot, RunUpdate, TaskRun, TaskRunError, TaskRunExecutionStatus, TaskRunStatus,
    TaskRunWaitpoint, Waitpoint, WaitpointOutput, WaitpointStatus, WaitpointType,
};
use crate::store::{StoreTransaction, StoreWrite};
use crate::worker::EngineJob;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct WaitpointSystem {
    resources: Arc<SystemResources>,
    snapshots: Arc<ExecutionSnapshotSystem>,
    release_concurrency: Arc<ReleaseConcurrencySystem>,
}

impl WaitpointSystem {
    pub fn new(
        resources: Arc<SystemResources>,
        snapshots: Arc<ExecutionSnapshotSystem>,
        release_concurrency: Arc<ReleaseConcurrencySystem>,
    ) -> Self {
        Self {
            resources,
            snapshots,
            release_concurrency,
        }
    }

    fn new_waitpoint(
        kind: WaitpointType,
        environment_id: Uuid,
        project_id: Uuid,
        idempotency_key: Option<String>,
    ) -> Waitpoint {
        let id = Uuid::now_v7();
        let user_provided_idempotency_key = idempotency_key.is_some();
        Waitpoint {
            id,
            friendly_id: generate_friendly_id("waitpoint"),
            kind,
            status: WaitpointStatus::Pending,
            idempotency_key: idempotency_key.unwrap_or_else(|| id.to_string()),
            user_provided_idempotency_key,
            output: None,
            output_type: JSON_OUTPUT_TYPE.to_string(),
            output_is_error: false,
            completed_by_task_run_id: None,
            completed_by_batch_id: None,
            completed_after: None,
            completed_at: None,
            project_id,
            environment_id,
            created_at: Utc::now(),
        }
    }

    /// A PENDING waitpoint for a run's own completion.
    pub fn run_waitpoint(run: &TaskRun) -> Waitpoint {
        let mut waitpoint = Self::new_waitpoint(
            WaitpointType::Run,
            run.runtime_environment_id,
            run.project_id,
            None,
        );
        waitpoint.idempotency_key = run.id.to_string();
        waitpoint.completed_by_task_run_id = Some(run.id);
        waitpoint
    }

    /// A PENDING waitpoint completed by a batch.
    pub fn batch_waitpoint(batch_id: Uuid, environment_id: Uuid, project_id: Uuid) -> Waitpoint {
        let mut waitpoint =
            Self::new_waitpoint(WaitpointType::Batch, environment_id, project_id, None);
        waitpoint.idempotency_key = batch_id.to_string();
        waitpoint.completed_by_batch_id = Some(batch_id);
        waitpoint
    }

    /// Output delivered to waiters of a finished run.
    pub fn output_for_finished_run(run: &TaskRun) -> WaitpointOutput {
        if run.status == TaskRunStatus::CompletedSuccessfully {
            return WaitpointOutput::success(output_string(run), run.output_type.clone());
        }
        let error = run
            .error
            .clone()
            .unwrap_or_else(|| TaskRunError::string(format!("Run finished with status {}", run.status)));
        let payload = serde_json::to_string(&error)
            .unwrap_or_else(|_| format!("{{\"message\":{:?}}}", error.message()));
        WaitpointOutput::error(payload)
    }

    #[instrument(skip(self))]
    pub async fn get_or_create_run_waitpoint(&self, run_id: Uuid) -> EngineResult<Waitpoint> {
        self.resources
            .lock_run("getOrCreateRunWaitpoint", run_id, move || async move {
                let run = self.resources.get_run(run_id).await?;
                if let Some(waitpoint_id) = run.associated_waitpoint_id {
                    if let Some(existing) = self.resources.store.find_waitpoint(waitpoint_id).await? {
                        return Ok(existing);
                    }
                }

                let now = Utc::now();
                let mut waitpoint = Self::run_waitpoint(&run);
                if run.is_final() {
                    let output = Self::output_for_finished_run(&run);
                    waitpoint.status = WaitpointStatus::Completed;
                    waitpoint.output = output.value;
                    if let Some(output_type) = output.output_type {
                        waitpoint.output_type = output_type;
                    }
                    waitpoint.output_is_error = output.is_error;
                    waitpoint.completed_at = Some(run.completed_at.unwrap_or(now));
                }

                let mut tx = StoreTransaction::new();
                tx.push(StoreWrite::InsertWaitpoint(waitpoint.clone()));
                tx.update_run(
                    run_id,
                    RunUpdate {
                        associated_waitpoint_id: Some(waitpoint.id),
                        ..Default::default()
                    },
                );
                self.resources.commit(tx).await?;
                debug!(run_id = %run_id, waitpoint_id = %waitpoint.id, completed = waitpoint.is_completed(), "Created run waitpoint");
                Ok(waitpoint)
            })
            .await
    }

    /// Complete a waitpoint and resume the runs it was blocking.
    ///
    /// Completing an already completed waitpoint keeps its first output.
    #[instrument(skip(self, output))]
    pub async fn complete_waitpoint(
        &self,
        waitpoint_id: Uuid,
        output: WaitpointOutput,
    ) -> EngineResult<Waitpoint> {
        let existing = self
            .resources
            .store
            .find_waitpoint(waitpoint_id)
            .await?
            .ok_or(EngineError::WaitpointNotFound { waitpoint_id })?;

        if !existing.is_completed() {
            let mut tx = StoreTransaction::new();
            tx.push(StoreWrite::CompleteWaitpoint {
                waitpoint_id,
                output,
                completed_at: Utc::now(),
            });
            self.resources.commit(tx).await?;
        }

        self.resume_blocked_runs(waitpoint_id).await?;
        self.resources
            .store
            .find_waitpoint(waitpoint_id)
            .await?
            .ok_or(EngineError::WaitpointNotFound { waitpoint_id })
    }

    /// Try to continue every run blocked by a waitpoint. A run that cannot be
    /// continued right now is retried through a scheduled job.
    pub async fn resume_blocked_runs(&self, waitpoint_id: Uuid) -> EngineResult<()> {
        let blocked = self.resources.store.find_runs_blocked_by(waitpoint_id).await?;
        for run_id in blocked {
            if let Err(e) = self.continue_run_if_unblocked(run_id).await {
                warn!(run_id = %run_id, waitpoint_id = %waitpoint_id, error = %e, "Failed to continue run, scheduling retry");
                self.resources
                    .jobs
                    .schedule(EngineJob::ContinueRunIfUnblocked { run_id }, Utc::now())
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn continue_run_if_unblocked(&self, run_id: Uuid) -> EngineResult<Option<ExecutionSnapshot>> {
        self.resources
            .lock_run("continueRunIfUnblocked", run_id, move || async move {
                self.continue_run_if_unblocked_locked(run_id).await
            })
            .await
    }

    /// Resume a run whose blockers are all complete. `None` while any
    /// blocker is pending or when the run is not waiting.
    pub async fn continue_run_if_unblocked_locked(
        &self,
        run_id: Uuid,
    ) -> EngineResult<Option<ExecutionSnapshot>> {
        let blockers = self.resources.store.find_blocking_waitpoints(run_id).await?;
        if blockers.iter().any(|b| !b.waitpoint.is_completed()) {
            return Ok(None);
        }

        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        if latest.execution_status != TaskRunExecutionStatus::ExecutingWithWaitpoints {
            debug!(run_id = %run_id, status = %latest.execution_status, "Run is not waiting, nothing to continue");
            return Ok(None);
        }

        let mut run = self.resources.get_run(run_id).await?;
        let completed: Vec<CompletedWaitpointRef> = blockers
            .iter()
            .map(|b| CompletedWaitpointRef {
                waitpoint_id: b.waitpoint.id,
                batch_index: b.relation.batch_index,
            })
            .collect();

        let now = Utc::now();
        let mut tx = StoreTransaction::new();
        stage_run_update(&mut tx, &mut run, RunUpdate::status(TaskRunStatus::Executing), now);
        tx.push(StoreWrite::DeleteBlockers { run_id });
        let snapshot = self.snapshots.create_execution_snapshot(
            &mut tx,
            &mut run,
            SnapshotInput::new(
                TaskRunExecutionStatus::Executing,
                "Run was unblocked, all waitpoints completed",
            )
            .with_completed_waitpoints(completed),
        );
        tx.emit(EngineEvent::WorkerNotification {
            run_id,
            snapshot_id: snapshot.id,
            execution_status: snapshot.execution_status,
        });
        self.resources.commit(tx).await?;

        self.release_concurrency.reacquire_for_resume(&run).await?;
        log_run_operation(
            "continueRunIfUnblocked",
            run_id,
            Some(snapshot.id),
            snapshot.execution_status.as_str(),
            None,
        );
        Ok(Some(snapshot))
    }

    #[instrument(skip(self, waitpoint_ids))]
    pub async fn block_run_with_waitpoint(
        &self,
        run_id: Uuid,
        waitpoint_ids: &[Uuid],
        batch: Option<BatchInfo>,
    ) -> EngineResult<ExecutionSnapshot> {
        self.resources
            .lock_run("blockRunWithWaitpoint", run_id, move || async move {
                self.block_run_with_waitpoint_locked(run_id, waitpoint_ids, batch)
                    .await
            })
            .await
    }

    /// Latest snapshot of `run_id` if the run is executing and may block.
    pub async fn ensure_blockable(&self, run_id: Uuid) -> EngineResult<ExecutionSnapshot> {
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        if !matches!(
            latest.execution_status,
            TaskRunExecutionStatus::Executing | TaskRunExecutionStatus::ExecutingWithWaitpoints
        ) {
            return Err(EngineError::invalid_state(
                run_id,
                latest.execution_status,
                "blockRunWithWaitpoint",
            ));
        }
        Ok(latest)
    }

    /// Block an executing run on waitpoints. If every waitpoint is already
    /// complete the run continues straight away.
    pub async fn block_run_with_waitpoint_locked(
        &self,
        run_id: Uuid,
        waitpoint_ids: &[Uuid],
        batch: Option<BatchInfo>,
    ) -> EngineResult<ExecutionSnapshot> {
        if waitpoint_ids.is_empty() {
            return Err(EngineError::InvalidInput(
                "At least one waitpoint is required to block a run".to_string(),
            ));
        }

        let latest = self.ensure_blockable(run_id).await?;

        let unique: HashSet<Uuid> = waitpoint_ids.iter().copied().collect();
        let found = self.resources.store.find_waitpoints(waitpoint_ids).await?;
        if let Some(missing) = unique
            .iter()
            .find(|id| !found.iter().any(|w| w.id == **id))
        {
            return Err(EngineError::WaitpointNotFound {
                waitpoint_id: *missing,
            });
        }

        let mut run = self.resources.get_run(run_id).await?;
        let now = Utc::now();
        let relations = found
            .iter()
            .map(|waitpoint| TaskRunWaitpoint {
                id: Uuid::now_v7(),
                task_run_id: run_id,
                waitpoint_id: waitpoint.id,
                project_id: run.project_id,
                batch_id: batch.as_ref().map(|b| b.id),
                batch_index: batch.as_ref().and_then(|b| b.index),
                created_at: now,
            })
            .collect();

        let mut tx = StoreTransaction::new();
        tx.push(StoreWrite::InsertBlockers(relations));
        let newly_blocked = latest.execution_status == TaskRunExecutionStatus::Executing;
        let snapshot = if newly_blocked {
            stage_run_update(
                &mut tx,
                &mut run,
                RunUpdate::status(TaskRunStatus::ExecutingWithWaitpoints),
                now,
            );
            self.snapshots.create_execution_snapshot(
                &mut tx,
                &mut run,
                SnapshotInput::new(
                    TaskRunExecutionStatus::ExecutingWithWaitpoints,
                    "Run was blocked by a waitpoint",
                ),
            )
        } else {
            latest
        };
        self.resources.commit(tx).await?;

        if newly_blocked {
            self.release_concurrency.release_for_waitpoint(&run).await?;
        }

        if let Some(continued) = self.continue_run_if_unblocked_locked(run_id).await? {
            return Ok(continued);
        }
        Ok(snapshot)
    }

    /// Detach every blocker of a run.
    pub async fn clear_blocking_waitpoints(&self, run_id: Uuid) -> EngineResult<()> {
        let mut tx = StoreTransaction::new();
        tx.push(StoreWrite::DeleteBlockers { run_id });
        self.resources.commit(tx).await
    }

    async fn find_idempotent(
        &self,
        environment: &AuthenticatedEnvironment,
        idempotency_key: Option<&str>,
    ) -> EngineResult<Option<Waitpoint>> {
        match idempotency_key {
            Some(key) => {
                self.resources
                    .store
                    .find_waitpoint_by_idempotency_key(environment.id, key)
                    .await
            }
            None => Ok(None),
        }
    }

    /// A waitpoint that completes on its own once `completed_after` passes.
    #[instrument(skip(self, environment), fields(environment_id = %environment.id))]
    pub async fn create_date_time_waitpoint(
        &self,
        environment: &AuthenticatedEnvironment,
        completed_after: DateTime<Utc>,
        idempotency_key: Option<String>,
    ) -> EngineResult<Waitpoint> {
        if let Some(existing) = self
            .find_idempotent(environment, idempotency_key.as_deref())
            .await?
        {
            return Ok(existing);
        }

        let mut waitpoint = Self::new_waitpoint(
            WaitpointType::Datetime,
            environment.id,
            environment.project_id,
            idempotency_key,
        );
        waitpoint.completed_after = Some(completed_after);

        let mut tx = StoreTransaction::new();
        tx.push(StoreWrite::InsertWaitpoint(waitpoint.clone()));
        tx.schedule_job(
            EngineJob::FinishDateTimeWaitpoint {
                waitpoint_id: waitpoint.id,
            },
            completed_after,
        );
        self.resources.commit(tx).await?;
        Ok(waitpoint)
    }

    /// A waitpoint completed only by an explicit [`Self::complete_waitpoint`].
    #[instrument(skip(self, environment), fields(environment_id = %environment.id))]
    pub async fn create_manual_waitpoint(
        &self,
        environment: &AuthenticatedEnvironment,
        idempotency_key: Option<String>,
    ) -> EngineResult<Waitpoint> {
        if let Some(existing) = self
            .find_idempotent(environment, idempotency_key.as_deref())
            .await?
        {
            return Ok(existing);
        }

        let waitpoint = Self::new_waitpoint(
            WaitpointType::Manual,
            environment.id,
            environment.project_id,
            idempotency_key,
        );
        let mut tx = StoreTransaction::new();
        tx.push(StoreWrite::InsertWaitpoint(waitpoint.clone()));
        self.resources.commit(tx).await?;
        Ok(waitpoint)
    }

    pub async fn finish_date_time_waitpoint(&self, waitpoint_id: Uuid) -> EngineResult<()> {
        match self
            .complete_waitpoint(waitpoint_id, WaitpointOutput::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(EngineError::WaitpointNotFound { .. }) => {
                warn!(waitpoint_id = %waitpoint_id, "Datetime waitpoint no longer exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
