//! # Execution Snapshot System
//!
//! Every state transition of a run appends an immutable [`ExecutionSnapshot`]
//! in the same transaction as the run row change. Callers hand back the id
//! of the snapshot they last saw; [`ExecutionSnapshotSystem::assert_latest`]
//! rejects stale ids with a conflict before anything is written.

use super::resources::SystemResources;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    CompletedWaitpointRef, ExecutionSnapshot, TaskRun, TaskRunExecutionStatus, WorkerIdentity,
};
use crate::store::{StoreTransaction, StoreWrite};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// What a new snapshot records beyond what it copies from the run.
#[derive(Debug, Clone)]
pub struct SnapshotInput {
    pub execution_status: TaskRunExecutionStatus,
    pub description: String,
    pub completed_waitpoints: Vec<CompletedWaitpointRef>,
    pub worker: WorkerIdentity,
    pub error: Option<String>,
}

impl SnapshotInput {
    pub fn new(execution_status: TaskRunExecutionStatus, description: impl Into<String>) -> Self {
        Self {
            execution_status,
            description: description.into(),
            completed_waitpoints: Vec::new(),
            worker: WorkerIdentity::default(),
            error: None,
        }
    }

    pub fn with_worker(mut self, worker: &WorkerIdentity) -> Self {
        self.worker = worker.clone();
        self
    }

    pub fn with_completed_waitpoints(mut self, completed: Vec<CompletedWaitpointRef>) -> Self {
        self.completed_waitpoints = completed;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug)]
pub struct ExecutionSnapshotSystem {
    resources: Arc<SystemResources>,
}

impl ExecutionSnapshotSystem {
    pub fn new(resources: Arc<SystemResources>) -> Self {
        Self { resources }
    }

    pub async fn get_latest_execution_snapshot(&self, run_id: Uuid) -> EngineResult<ExecutionSnapshot> {
        self.resources
            .store
            .find_latest_snapshot(run_id)
            .await?
            .ok_or(EngineError::SnapshotNotFound { run_id })
    }

    /// Latest snapshot, provided it is the one the caller observed.
    pub async fn assert_latest(&self, run_id: Uuid, snapshot_id: Uuid) -> EngineResult<ExecutionSnapshot> {
        let latest = self.get_latest_execution_snapshot(run_id).await?;
        if latest.id != snapshot_id {
            return Err(EngineError::snapshot_conflict(run_id, snapshot_id, latest.id));
        }
        Ok(latest)
    }

    /// Stage a snapshot chained after `previous_snapshot_id`.
    ///
    /// `run` must already reflect the run update staged in the same
    /// transaction; the snapshot mirrors its status and attempt number.
    pub fn create_execution_snapshot(
        &self,
        tx: &mut StoreTransaction,
        run: &mut TaskRun,
        input: SnapshotInput,
    ) -> ExecutionSnapshot {
        let snapshot = ExecutionSnapshot {
            id: Uuid::now_v7(),
            run_id: run.id,
            execution_status: input.execution_status,
            description: input.description,
            run_status: run.status,
            attempt_number: (run.attempt_number > 0).then_some(run.attempt_number),
            previous_snapshot_id: run.latest_snapshot_id,
            environment_id: run.runtime_environment_id,
            environment_type: run.environment_type,
            project_id: run.project_id,
            organization_id: run.organization_id,
            completed_waitpoints: input.completed_waitpoints,
            batch_id: run.batch_id,
            worker_id: input.worker.worker_id,
            runner_id: input.worker.runner_id,
            error: input.error,
            created_at: Utc::now(),
        };
        run.latest_snapshot_id = Some(snapshot.id);
        tx.push(StoreWrite::InsertSnapshot(snapshot.clone()));
        snapshot
    }

    /// Snapshots created after `snapshot_id`, oldest first.
    pub async fn get_snapshots_since(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
    ) -> EngineResult<Vec<ExecutionSnapshot>> {
        let snapshots = self.resources.store.list_snapshots(run_id).await?;
        let position = snapshots
            .iter()
            .position(|s| s.id == snapshot_id)
            .ok_or(EngineError::SnapshotNotFound { run_id })?;
        Ok(snapshots.into_iter().skip(position + 1).collect())
    }
}
