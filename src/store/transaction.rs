use crate::events::EngineEvent;
use crate::models::{
    BatchTaskRun, BatchTaskRunItem, BatchUpdate, ExecutionSnapshot, RunUpdate, TaskRun,
    TaskRunWaitpoint, Waitpoint, WaitpointOutput,
};
use crate::worker::{EngineJob, JobAction};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One row-level change inside a [`StoreTransaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    InsertRun(TaskRun),
    UpdateRun {
        run_id: Uuid,
        update: RunUpdate,
    },
    /// Rejected with a conflict unless `previous_snapshot_id` is the run's
    /// current latest snapshot
    InsertSnapshot(ExecutionSnapshot),
    InsertWaitpoint(Waitpoint),
    /// Only transitions PENDING waitpoints; a completed one is left untouched
    CompleteWaitpoint {
        waitpoint_id: Uuid,
        output: WaitpointOutput,
        completed_at: DateTime<Utc>,
    },
    /// Idempotent on (run, waitpoint, batch index)
    InsertBlockers(Vec<TaskRunWaitpoint>),
    DeleteBlockers {
        run_id: Uuid,
    },
    InsertBatch(BatchTaskRun),
    UpdateBatch {
        batch_id: Uuid,
        update: BatchUpdate,
    },
    /// Records one item outcome and bumps the batch counters; a second record
    /// for the same index is ignored
    RecordBatchItem(BatchTaskRunItem),
}

/// Unit of work committed all-or-nothing by an [`super::EngineStore`].
///
/// Events and job actions ride along and are only released once the writes
/// have committed.
#[derive(Debug, Default)]
pub struct StoreTransaction {
    writes: Vec<StoreWrite>,
    events: Vec<EngineEvent>,
    jobs: Vec<JobAction>,
    created_snapshots: Vec<ExecutionSnapshot>,
}

impl StoreTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: StoreWrite) -> &mut Self {
        if let StoreWrite::InsertSnapshot(snapshot) = &write {
            self.created_snapshots.push(snapshot.clone());
        }
        self.writes.push(write);
        self
    }

    pub fn update_run(&mut self, run_id: Uuid, update: RunUpdate) -> &mut Self {
        self.push(StoreWrite::UpdateRun { run_id, update })
    }

    pub fn emit(&mut self, event: EngineEvent) -> &mut Self {
        self.events.push(event);
        self
    }

    pub fn schedule_job(&mut self, job: EngineJob, run_at: DateTime<Utc>) -> &mut Self {
        self.jobs.push(JobAction::Schedule { job, run_at });
        self
    }

    pub fn ack_job(&mut self, job_id: impl Into<String>) -> &mut Self {
        self.jobs.push(JobAction::Ack {
            job_id: job_id.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.events.is_empty() && self.jobs.is_empty()
    }

    pub fn writes(&self) -> &[StoreWrite] {
        &self.writes
    }

    /// Snapshots inserted by this transaction, oldest first.
    pub fn created_snapshots(&self) -> &[ExecutionSnapshot] {
        &self.created_snapshots
    }

    pub fn into_parts(self) -> TransactionParts {
        TransactionParts {
            writes: self.writes,
            events: self.events,
            jobs: self.jobs,
            created_snapshots: self.created_snapshots,
        }
    }
}

#[derive(Debug, Default)]
pub struct TransactionParts {
    pub writes: Vec<StoreWrite>,
    pub events: Vec<EngineEvent>,
    pub jobs: Vec<JobAction>,
    pub created_snapshots: Vec<ExecutionSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_keep_write_order() {
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        let mut tx = StoreTransaction::new();
        tx.push(StoreWrite::DeleteBlockers { run_id: first })
            .push(StoreWrite::DeleteBlockers { run_id: second })
            .ack_job("expireRun:x");

        assert!(!tx.is_empty());
        let parts = tx.into_parts();
        assert_eq!(
            parts.writes,
            vec![
                StoreWrite::DeleteBlockers { run_id: first },
                StoreWrite::DeleteBlockers { run_id: second },
            ]
        );
        assert_eq!(parts.jobs.len(), 1);
        assert!(parts.created_snapshots.is_empty());
    }
}
