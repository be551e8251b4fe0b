//! In-process [`EngineStore`] used by tests and embedded engines.
//!
//! A commit clones the tables, applies every write to the copy and swaps the
//! copy in only if all writes succeeded, which gives the same all-or-nothing
//! behaviour as a SQL transaction.

use super::traits::EngineStore;
use super::transaction::StoreWrite;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    BatchItemOutcome, BatchTaskRun, BatchTaskRunItem, BlockingWaitpoint, ExecutionSnapshot,
    TaskRun, TaskRunStatus, TaskRunWaitpoint, Waitpoint, WaitpointStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryTables {
    runs: HashMap<Uuid, TaskRun>,
    snapshots: HashMap<Uuid, Vec<ExecutionSnapshot>>,
    waitpoints: HashMap<Uuid, Waitpoint>,
    blockers: Vec<TaskRunWaitpoint>,
    batches: HashMap<Uuid, BatchTaskRun>,
    batch_items: HashMap<Uuid, BTreeMap<u32, BatchTaskRunItem>>,
}

#[derive(Debug, Default)]
pub struct MemoryEngineStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryEngineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryTables {
    fn apply(&mut self, write: StoreWrite) -> EngineResult<()> {
        let now = Utc::now();
        match write {
            StoreWrite::InsertRun(run) => {
                if self.runs.contains_key(&run.id) {
                    return Err(EngineError::InvalidInput(format!(
                        "Run {} already exists",
                        run.id
                    )));
                }
                self.runs.insert(run.id, run);
            }
            StoreWrite::UpdateRun { run_id, update } => {
                let run = self
                    .runs
                    .get_mut(&run_id)
                    .ok_or(EngineError::RunNotFound { run_id })?;
                update.apply_to(run, now);
            }
            StoreWrite::InsertSnapshot(snapshot) => {
                let run = self
                    .runs
                    .get_mut(&snapshot.run_id)
                    .ok_or(EngineError::RunNotFound {
                        run_id: snapshot.run_id,
                    })?;
                if run.latest_snapshot_id != snapshot.previous_snapshot_id {
                    return Err(EngineError::snapshot_conflict(
                        snapshot.run_id,
                        snapshot.previous_snapshot_id.unwrap_or(Uuid::nil()),
                        run.latest_snapshot_id.unwrap_or(Uuid::nil()),
                    ));
                }
                run.latest_snapshot_id = Some(snapshot.id);
                self.snapshots
                    .entry(snapshot.run_id)
                    .or_default()
                    .push(snapshot);
            }
            StoreWrite::InsertWaitpoint(waitpoint) => {
                let duplicate = self.waitpoints.values().any(|existing| {
                    existing.environment_id == waitpoint.environment_id
                        && existing.idempotency_key == waitpoint.idempotency_key
                });
                if duplicate || self.waitpoints.contains_key(&waitpoint.id) {
                    return Err(EngineError::InvalidInput(format!(
                        "Waitpoint with idempotency key {} already exists",
                        waitpoint.idempotency_key
                    )));
                }
                self.waitpoints.insert(waitpoint.id, waitpoint);
            }
            StoreWrite::CompleteWaitpoint {
                waitpoint_id,
                output,
                completed_at,
            } => {
                let waitpoint = self
                    .waitpoints
                    .get_mut(&waitpoint_id)
                    .ok_or(EngineError::WaitpointNotFound { waitpoint_id })?;
                if waitpoint.status == WaitpointStatus::Pending {
                    waitpoint.status = WaitpointStatus::Completed;
                    waitpoint.output = output.value;
                    if let Some(output_type) = output.output_type {
                        waitpoint.output_type = output_type;
                    }
                    waitpoint.output_is_error = output.is_error;
                    waitpoint.completed_at = Some(completed_at);
                }
            }
            StoreWrite::InsertBlockers(relations) => {
                for relation in relations {
                    if !self.waitpoints.contains_key(&relation.waitpoint_id) {
                        return Err(EngineError::WaitpointNotFound {
                            waitpoint_id: relation.waitpoint_id,
                        });
                    }
                    let key = relation.dedupe_key();
                    if !self.blockers.iter().any(|existing| existing.dedupe_key() == key) {
                        self.blockers.push(relation);
                    }
                }
            }
            StoreWrite::DeleteBlockers { run_id } => {
                self.blockers.retain(|relation| relation.task_run_id != run_id);
            }
            StoreWrite::InsertBatch(batch) => {
                self.batches.insert(batch.id, batch);
            }
            StoreWrite::UpdateBatch { batch_id, update } => {
                let batch = self
                    .batches
                    .get_mut(&batch_id)
                    .ok_or(EngineError::BatchNotFound { batch_id })?;
                update.apply_to(batch, now);
            }
            StoreWrite::RecordBatchItem(item) => {
                let batch = self
                    .batches
                    .get_mut(&item.batch_id)
                    .ok_or(EngineError::BatchNotFound {
                        batch_id: item.batch_id,
                    })?;
                let items = self.batch_items.entry(item.batch_id).or_default();
                if items.contains_key(&item.index) {
                    return Ok(());
                }
                batch.processed_count += 1;
                match &item.outcome {
                    BatchItemOutcome::Triggered { run_id } => {
                        batch.successful_run_count += 1;
                        batch.run_ids.push(*run_id);
                    }
                    BatchItemOutcome::Failed { .. } => batch.failed_run_count += 1,
                }
                batch.updated_at = now;
                items.insert(item.index, item);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EngineStore for MemoryEngineStore {
    async fn find_run(&self, run_id: Uuid) -> EngineResult<Option<TaskRun>> {
        Ok(self.tables.lock().runs.get(&run_id).cloned())
    }

    async fn find_latest_snapshot(&self, run_id: Uuid) -> EngineResult<Option<ExecutionSnapshot>> {
        let tables = self.tables.lock();
        let latest_id = tables.runs.get(&run_id).and_then(|run| run.latest_snapshot_id);
        Ok(latest_id.and_then(|id| {
            tables
                .snapshots
                .get(&run_id)
                .and_then(|chain| chain.iter().rev().find(|s| s.id == id).cloned())
        }))
    }

    async fn list_snapshots(&self, run_id: Uuid) -> EngineResult<Vec<ExecutionSnapshot>> {
        Ok(self
            .tables
            .lock()
            .snapshots
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_waitpoint(&self, waitpoint_id: Uuid) -> EngineResult<Option<Waitpoint>> {
        Ok(self.tables.lock().waitpoints.get(&waitpoint_id).cloned())
    }

    async fn find_waitpoints(&self, waitpoint_ids: &[Uuid]) -> EngineResult<Vec<Waitpoint>> {
        let tables = self.tables.lock();
        Ok(waitpoint_ids
            .iter()
            .filter_map(|id| tables.waitpoints.get(id).cloned())
            .collect())
    }

    async fn find_waitpoint_by_idempotency_key(
        &self,
        environment_id: Uuid,
        idempotency_key: &str,
    ) -> EngineResult<Option<Waitpoint>> {
        Ok(self
            .tables
            .lock()
            .waitpoints
            .values()
            .find(|w| w.environment_id == environment_id && w.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn find_blocking_waitpoints(&self, run_id: Uuid) -> EngineResult<Vec<BlockingWaitpoint>> {
        let tables = self.tables.lock();
        Ok(tables
            .blockers
            .iter()
            .filter(|relation| relation.task_run_id == run_id)
            .filter_map(|relation| {
                tables
                    .waitpoints
                    .get(&relation.waitpoint_id)
                    .map(|waitpoint| BlockingWaitpoint {
                        relation: relation.clone(),
                        waitpoint: waitpoint.clone(),
                    })
            })
            .collect())
    }

    async fn find_runs_blocked_by(&self, waitpoint_id: Uuid) -> EngineResult<Vec<Uuid>> {
        let tables = self.tables.lock();
        let mut run_ids: Vec<Uuid> = tables
            .blockers
            .iter()
            .filter(|relation| relation.waitpoint_id == waitpoint_id)
            .map(|relation| relation.task_run_id)
            .collect();
        run_ids.sort();
        run_ids.dedup();
        Ok(run_ids)
    }

    async fn find_child_runs(&self, parent_run_id: Uuid) -> EngineResult<Vec<TaskRun>> {
        let tables = self.tables.lock();
        let mut children: Vec<TaskRun> = tables
            .runs
            .values()
            .filter(|run| run.parent_task_run_id == Some(parent_run_id))
            .cloned()
            .collect();
        children.sort_by_key(|run| run.created_at);
        Ok(children)
    }

    async fn find_batch(&self, batch_id: Uuid) -> EngineResult<Option<BatchTaskRun>> {
        Ok(self.tables.lock().batches.get(&batch_id).cloned())
    }

    async fn list_batch_items(&self, batch_id: Uuid) -> EngineResult<Vec<BatchTaskRunItem>> {
        Ok(self
            .tables
            .lock()
            .batch_items
            .get(&batch_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_debounced_run(
        &self,
        environment_id: Uuid,
        task_identifier: &str,
        debounce_key: &str,
    ) -> EngineResult<Option<TaskRun>> {
        Ok(self
            .tables
            .lock()
            .runs
            .values()
            .filter(|run| {
                run.runtime_environment_id == environment_id
                    && run.task_identifier == task_identifier
                    && run.debounce_key.as_deref() == Some(debounce_key)
                    && run.status == TaskRunStatus::Delayed
            })
            .max_by_key(|run| run.created_at)
            .cloned())
    }

    async fn commit(&self, writes: Vec<StoreWrite>) -> EngineResult<()> {
        let mut tables = self.tables.lock();
        let mut staged = tables.clone();
        let count = writes.len();
        for write in writes {
            staged.apply(write)?;
        }
        *tables = staged;
        debug!(writes = count, "Committed memory store transaction");
        Ok(())
    }
}
