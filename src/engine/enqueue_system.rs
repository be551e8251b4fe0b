//! Moves runs into the QUEUED state and hands them to the run queue.

use super::execution_snapshot_system::{ExecutionSnapshotSystem, SnapshotInput};
use super::resources::{environment_of, SystemResources};
use crate::error::EngineResult;
use crate::models::{ExecutionSnapshot, TaskRun, TaskRunExecutionStatus};
use crate::run_queue::QueueMessage;
use crate::store::StoreTransaction;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug)]
pub struct EnqueueSystem {
    resources: Arc<SystemResources>,
    snapshots: Arc<ExecutionSnapshotSystem>,
}

impl EnqueueSystem {
    pub fn new(resources: Arc<SystemResources>, snapshots: Arc<ExecutionSnapshotSystem>) -> Self {
        Self {
            resources,
            snapshots,
        }
    }

    /// Stage the QUEUED snapshot. The message itself is written by
    /// [`EnqueueSystem::enqueue_run`] once the transaction has committed.
    pub fn stage_enqueue(
        &self,
        tx: &mut StoreTransaction,
        run: &mut TaskRun,
        description: &str,
    ) -> ExecutionSnapshot {
        self.snapshots.create_execution_snapshot(
            tx,
            run,
            SnapshotInput::new(TaskRunExecutionStatus::Queued, description),
        )
    }

    pub fn queue_message(&self, run: &TaskRun) -> QueueMessage {
        let queued_at = run.queue_timestamp.unwrap_or(run.created_at);
        QueueMessage {
            run_id: run.id,
            task_identifier: run.task_identifier.clone(),
            organization_id: run.organization_id,
            project_id: run.project_id,
            environment_id: run.runtime_environment_id,
            environment_type: run.environment_type,
            queue: run.queue.clone(),
            concurrency_key: run.concurrency_key.clone(),
            timestamp: queued_at.timestamp_millis() - run.priority_ms,
            attempt: 0,
            master_queue: run.master_queue.clone(),
        }
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, queue = %run.queue))]
    pub async fn enqueue_run(&self, run: &TaskRun) -> EngineResult<()> {
        self.resources
            .run_queue
            .enqueue_message(&environment_of(run), self.queue_message(run), &run.master_queue)
            .await
    }
}
