use super::transaction::StoreWrite;
use crate::error::EngineResult;
use crate::models::{
    BatchTaskRun, BatchTaskRunItem, BlockingWaitpoint, ExecutionSnapshot, TaskRun, Waitpoint,
};
use async_trait::async_trait;
use uuid::Uuid;

/// Transactional persistence for runs, snapshots, waitpoints and batches.
///
/// Reads are point-in-time. Writes go through [`EngineStore::commit`], which
/// applies every write or none of them.
#[async_trait]
pub trait EngineStore: Send + Sync + std::fmt::Debug {
    async fn find_run(&self, run_id: Uuid) -> EngineResult<Option<TaskRun>>;

    async fn find_latest_snapshot(&self, run_id: Uuid) -> EngineResult<Option<ExecutionSnapshot>>;

    /// Every snapshot of a run, oldest first.
    async fn list_snapshots(&self, run_id: Uuid) -> EngineResult<Vec<ExecutionSnapshot>>;

    async fn find_waitpoint(&self, waitpoint_id: Uuid) -> EngineResult<Option<Waitpoint>>;

    async fn find_waitpoints(&self, waitpoint_ids: &[Uuid]) -> EngineResult<Vec<Waitpoint>>;

    async fn find_waitpoint_by_idempotency_key(
        &self,
        environment_id: Uuid,
        idempotency_key: &str,
    ) -> EngineResult<Option<Waitpoint>>;

    /// Blocking relations of a run joined with their waitpoints.
    async fn find_blocking_waitpoints(&self, run_id: Uuid) -> EngineResult<Vec<BlockingWaitpoint>>;

    /// Runs currently blocked by a waitpoint.
    async fn find_runs_blocked_by(&self, waitpoint_id: Uuid) -> EngineResult<Vec<Uuid>>;

    async fn find_child_runs(&self, parent_run_id: Uuid) -> EngineResult<Vec<TaskRun>>;

    async fn find_batch(&self, batch_id: Uuid) -> EngineResult<Option<BatchTaskRun>>;

    /// Recorded items of a batch ordered by index.
    async fn list_batch_items(&self, batch_id: Uuid) -> EngineResult<Vec<BatchTaskRunItem>>;

    /// A still-delayed run carrying the debounce key, if any.
    async fn find_debounced_run(
        &self,
        environment_id: Uuid,
        task_identifier: &str,
        debounce_key: &str,
    ) -> EngineResult<Option<TaskRun>>;

    async fn commit(&self, writes: Vec<StoreWrite>) -> EngineResult<()>;
}
