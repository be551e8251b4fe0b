//! Hands queued runs to workers.
//!
//! A message popped off the queue is only a candidate: the run is claimed
//! under its lock by moving it to PENDING_EXECUTING. Messages whose run is
//! gone, finished or not QUEUED are acknowledged and dropped.

use super::execution_snapshot_system::{ExecutionSnapshotSystem, SnapshotInput};
use super::resources::{expire_job_id, SystemResources};
use crate::error::EngineResult;
use crate::logging::{log_error, log_run_operation};
use crate::models::{DequeuedMessage, EnvironmentInfo, TaskRunExecutionStatus, WorkerIdentity};
use crate::store::StoreTransaction;
use chrono::Utc;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct DequeueSystem {
    resources: Arc<SystemResources>,
    snapshots: Arc<ExecutionSnapshotSystem>,
}

impl DequeueSystem {
    pub fn new(resources: Arc<SystemResources>, snapshots: Arc<ExecutionSnapshotSystem>) -> Self {
        Self {
            resources,
            snapshots,
        }
    }

    #[instrument(skip(self))]
    pub async fn dequeue_from_master_queue(
        &self,
        consumer_id: &str,
        master_queue: &str,
        max_runs: usize,
    ) -> EngineResult<Vec<DequeuedMessage>> {
        let messages = self
            .resources
            .run_queue
            .dequeue_message_in_shared_queue(consumer_id, master_queue, max_runs)
            .await?;

        let mut dequeued = Vec::with_capacity(messages.len());
        for queued in messages {
            let run_id = queued.message.run_id;
            let organization_id = queued.message.organization_id;
            match self.claim_run(run_id, consumer_id).await {
                Ok(Some(message)) => dequeued.push(message),
                Ok(None) => {
                    self.resources
                        .run_queue
                        .acknowledge_message(organization_id, run_id)
                        .await?;
                }
                Err(e) => {
                    log_error(
                        "DequeueSystem",
                        "dequeue_from_master_queue",
                        &e.to_string(),
                        Some(&format!("run {run_id}")),
                    );
                    if let Err(nack_error) = self
                        .resources
                        .run_queue
                        .nack_message(organization_id, run_id, None)
                        .await
                    {
                        warn!(run_id = %run_id, error = %nack_error, "Failed to nack run after dequeue error");
                    }
                }
            }
        }
        Ok(dequeued)
    }

    /// `None` when the message no longer describes a dequeueable run.
    async fn claim_run(&self, run_id: Uuid, consumer_id: &str) -> EngineResult<Option<DequeuedMessage>> {
        self.resources
            .lock_run("dequeueRun", run_id, move || async move {
                let Some(mut run) = self.resources.store.find_run(run_id).await? else {
                    warn!(run_id = %run_id, "Dequeued a run that does not exist");
                    return Ok(None);
                };
                let Some(latest) = self.resources.store.find_latest_snapshot(run_id).await? else {
                    warn!(run_id = %run_id, "Dequeued a run without snapshots");
                    return Ok(None);
                };
                if run.is_final() || !latest.execution_status.is_dequeueable() {
                    warn!(
                        run_id = %run_id,
                        status = %run.status,
                        execution_status = %latest.execution_status,
                        "Dequeued a run that is not queued, dropping the message"
                    );
                    return Ok(None);
                }

                let worker = WorkerIdentity {
                    worker_id: Some(consumer_id.to_string()),
                    runner_id: None,
                };
                let mut tx = StoreTransaction::new();
                let snapshot = self.snapshots.create_execution_snapshot(
                    &mut tx,
                    &mut run,
                    SnapshotInput::new(
                        TaskRunExecutionStatus::PendingExecuting,
                        "Run was dequeued for execution",
                    )
                    .with_worker(&worker),
                );
                tx.ack_job(expire_job_id(&run_id));
                self.resources.commit(tx).await?;

                log_run_operation(
                    "dequeueRun",
                    run_id,
                    Some(snapshot.id),
                    snapshot.execution_status.as_str(),
                    Some(consumer_id),
                );
                Ok(Some(DequeuedMessage {
                    environment: EnvironmentInfo::from_run(&run),
                    machine: self
                        .resources
                        .config
                        .machines
                        .resolve(run.machine_preset.as_deref()),
                    consumer_id: consumer_id.to_string(),
                    dequeued_at: Utc::now(),
                    run,
                    snapshot,
                }))
            })
            .await
    }
}
