//! # Run Attempt System
//!
//! State machine over a run's attempts: starting, succeeding, failing with
//! or without a retry, cancellation, forced requeues and infrastructure
//! failures.
//!
//! ## Locking
//!
//! Every public operation takes the run's lock, validates the caller's
//! snapshot id, then stages the run update and the new snapshot in one
//! transaction. Work that touches other runs (resuming waiters of a finished
//! run) happens after the lock is released.

use super::execution_snapshot_system::{ExecutionSnapshotSystem, SnapshotInput};
use super::resources::{
    delayed_job_id, expire_job_id, output_value, stage_run_update, SystemResources,
};
use super::waitpoint_system::WaitpointSystem;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::logging::{log_error, log_run_operation};
use crate::models::{
    AttemptInfo, AttemptStatus, BatchInfo, CancelRunRequest, CompleteRunAttemptResult,
    EnvironmentInfo, ExecutionResult, ExecutionSnapshot, QueueInfo, RunInfo, RunUpdate,
    StartRunAttemptResult, TaskInfo, TaskRun, TaskRunError, TaskRunErrorCode,
    TaskRunExecution, TaskRunExecutionResult, TaskRunExecutionRetry, TaskRunExecutionStatus,
    TaskRunStatus, WorkerIdentity,
};
use crate::retry::{retry_outcome_from_completion, RetryOutcome, RetryOutcomeParams};
use crate::store::{StoreTransaction, StoreWrite};
use crate::worker::EngineJob;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// A failed attempt, reported by a worker or detected by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub error: TaskRunError,
    pub retry: Option<TaskRunExecutionRetry>,
    pub skipped_retrying: bool,
    pub metadata: Option<Value>,
}

impl AttemptFailure {
    pub fn new(error: TaskRunError) -> Self {
        Self {
            error,
            retry: None,
            skipped_retrying: false,
            metadata: None,
        }
    }
}

/// Terminal state a run is being moved into.
#[derive(Debug, Clone)]
pub(crate) struct RunFinish {
    pub status: TaskRunStatus,
    pub description: String,
    pub output: Option<String>,
    pub output_type: Option<String>,
    pub error: Option<TaskRunError>,
    pub metadata: Option<Value>,
    pub completed_at: DateTime<Utc>,
}

impl RunFinish {
    pub fn failed(
        status: TaskRunStatus,
        error: TaskRunError,
        description: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            description: description.into(),
            output: None,
            output_type: None,
            error: Some(error),
            metadata: None,
            completed_at,
        }
    }
}

/// Result of a locked operation plus the run to follow up on once the lock
/// is released, if it finished.
type WithFollowUp<T> = (T, Option<TaskRun>);

#[derive(Debug)]
pub struct RunAttemptSystem {
    resources: Arc<SystemResources>,
    snapshots: Arc<ExecutionSnapshotSystem>,
    waitpoints: Arc<WaitpointSystem>,
}

impl RunAttemptSystem {
    pub fn new(
        resources: Arc<SystemResources>,
        snapshots: Arc<ExecutionSnapshotSystem>,
        waitpoints: Arc<WaitpointSystem>,
    ) -> Self {
        Self {
            resources,
            snapshots,
            waitpoints,
        }
    }

    #[instrument(skip(self, worker))]
    pub async fn start_run_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        worker: WorkerIdentity,
        is_warm_start: bool,
    ) -> EngineResult<StartRunAttemptResult> {
        let (result, finished) = self
            .resources
            .lock_run("startRunAttempt", run_id, move || async move {
                let latest = self.snapshots.assert_latest(run_id, snapshot_id).await?;
                let mut run = self.resources.get_run(run_id).await?;

                if run.status == TaskRunStatus::Canceled {
                    return Err(EngineError::RunAlreadyCanceled { run_id });
                }
                let startable = match latest.execution_status {
                    TaskRunExecutionStatus::PendingExecuting => true,
                    TaskRunExecutionStatus::Executing => {
                        run.status == TaskRunStatus::RetryingAfterFailure
                    }
                    _ => false,
                };
                if run.is_final() || !startable {
                    return Err(EngineError::invalid_state(
                        run_id,
                        latest.execution_status,
                        "startRunAttempt",
                    ));
                }

                let now = Utc::now();
                let max_attempts = run.effective_max_attempts();
                let next_attempt = run.attempt_number + 1;
                if next_attempt > max_attempts {
                    let error = TaskRunError::internal(
                        TaskRunErrorCode::MaxAttemptsExceeded,
                        format!("Run reached its maximum of {max_attempts} attempts"),
                    );
                    self.fail_run(&mut run, error, None, &worker, now).await?;
                    return Ok((
                        Err(EngineError::MaxAttemptsReached {
                            run_id,
                            max_attempts,
                        }),
                        Some(run),
                    ));
                }

                let mut tx = StoreTransaction::new();
                stage_run_update(
                    &mut tx,
                    &mut run,
                    RunUpdate {
                        status: Some(TaskRunStatus::Executing),
                        attempt_number: Some(next_attempt),
                        started_at: Some(now),
                        executed_at: Some(now),
                        ..Default::default()
                    },
                    now,
                );
                let description = if is_warm_start {
                    "Attempt created, starting warm"
                } else {
                    "Attempt created, starting execution"
                };
                let snapshot = self.snapshots.create_execution_snapshot(
                    &mut tx,
                    &mut run,
                    SnapshotInput::new(TaskRunExecutionStatus::Executing, description)
                        .with_worker(&worker),
                );
                tx.ack_job(expire_job_id(&run_id));
                tx.emit(EngineEvent::RunAttemptStarted {
                    run_id,
                    attempt_number: next_attempt,
                    environment_id: run.runtime_environment_id,
                    started_at: now,
                });
                self.resources.commit(tx).await?;

                log_run_operation(
                    "startRunAttempt",
                    run_id,
                    Some(snapshot.id),
                    snapshot.execution_status.as_str(),
                    Some(&format!("attempt {next_attempt}")),
                );
                let execution = self.build_execution(&run, now);
                Ok((
                    Ok(StartRunAttemptResult {
                        run,
                        snapshot,
                        execution,
                    }),
                    None,
                ))
            })
            .await?;

        if let Some(run) = finished {
            self.after_run_finished(&run).await?;
        }
        result
    }

    fn build_execution(&self, run: &TaskRun, started_at: DateTime<Utc>) -> TaskRunExecution {
        TaskRunExecution {
            task: TaskInfo {
                identifier: run.task_identifier.clone(),
            },
            attempt: AttemptInfo {
                number: run.attempt_number,
                started_at,
            },
            run: RunInfo {
                id: run.id,
                friendly_id: run.friendly_id.clone(),
                payload: run.payload.clone(),
                payload_type: run.payload_type.clone(),
                created_at: run.created_at,
                max_attempts: run.effective_max_attempts(),
                metadata: run.metadata.clone(),
                parent_task_run_id: run.parent_task_run_id,
                root_task_run_id: run.root_task_run_id,
                depth: run.depth,
            },
            queue: QueueInfo {
                name: run.queue.clone(),
                concurrency_key: run.concurrency_key.clone(),
                master_queue: run.master_queue.clone(),
            },
            environment: EnvironmentInfo::from_run(run),
            machine: self
                .resources
                .config
                .machines
                .resolve(run.machine_preset.as_deref()),
            batch: run.batch_id.map(|id| BatchInfo {
                id,
                index: run.batch_index,
            }),
        }
    }

    /// Dispatch a worker's completion to the success or failure path.
    pub async fn complete_run_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completion: TaskRunExecutionResult,
        worker: WorkerIdentity,
    ) -> EngineResult<CompleteRunAttemptResult> {
        match completion {
            TaskRunExecutionResult::Success {
                output,
                output_type,
                metadata,
            } => {
                self.attempt_succeeded(run_id, snapshot_id, output, output_type, metadata, worker)
                    .await
            }
            TaskRunExecutionResult::Failure {
                error,
                retry,
                skipped_retrying,
                metadata,
            } => {
                let failure = AttemptFailure {
                    error,
                    retry,
                    skipped_retrying,
                    metadata,
                };
                self.attempt_failed(run_id, snapshot_id, failure, worker, false)
                    .await
            }
        }
    }

    #[instrument(skip(self, output, output_type, metadata, worker))]
    pub async fn attempt_succeeded(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        output: Option<String>,
        output_type: Option<String>,
        metadata: Option<Value>,
        worker: WorkerIdentity,
    ) -> EngineResult<CompleteRunAttemptResult> {
        let (result, finished) = self
            .resources
            .lock_run("attemptSucceeded", run_id, move || async move {
                let latest = self.snapshots.assert_latest(run_id, snapshot_id).await?;
                let mut run = self.resources.get_run(run_id).await?;

                match latest.execution_status {
                    TaskRunExecutionStatus::PendingCancel => {
                        let snapshot = self.finalize_pending_cancel(&mut run, &worker).await?;
                        return Ok((
                            finished_result(AttemptStatus::RunFinished, &run, snapshot),
                            Some(run),
                        ));
                    }
                    TaskRunExecutionStatus::Executing
                    | TaskRunExecutionStatus::ExecutingWithWaitpoints => {}
                    other => {
                        return Err(EngineError::invalid_state(run_id, other, "attemptSucceeded"))
                    }
                }

                let now = Utc::now();
                let mut tx = StoreTransaction::new();
                let snapshot = self.stage_finish_run(
                    &mut tx,
                    &mut run,
                    RunFinish {
                        status: TaskRunStatus::CompletedSuccessfully,
                        description: "Task completed successfully".to_string(),
                        output: output.clone(),
                        output_type: output_type.clone(),
                        error: None,
                        metadata,
                        completed_at: now,
                    },
                    &worker,
                );
                tx.emit(EngineEvent::RunSucceeded {
                    run_id,
                    output,
                    output_type,
                    completed_at: now,
                });
                self.resources.commit(tx).await?;

                log_run_operation(
                    "attemptSucceeded",
                    run_id,
                    Some(snapshot.id),
                    run.status.as_str(),
                    None,
                );
                Ok((
                    finished_result(AttemptStatus::RunFinished, &run, snapshot),
                    Some(run),
                ))
            })
            .await?;

        if let Some(run) = finished {
            self.after_run_finished(&run).await?;
        }
        Ok(result)
    }

    #[instrument(skip(self, failure, worker))]
    pub async fn attempt_failed(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        failure: AttemptFailure,
        worker: WorkerIdentity,
        force_requeue: bool,
    ) -> EngineResult<CompleteRunAttemptResult> {
        let (result, finished) = self
            .resources
            .lock_run("attemptFailed", run_id, move || async move {
                self.attempt_failed_locked(run_id, Some(snapshot_id), failure, &worker, force_requeue)
                    .await
            })
            .await?;

        if let Some(run) = finished {
            self.after_run_finished(&run).await?;
        }
        Ok(result)
    }

    /// Failure path for a caller already holding the run lock. Without a
    /// `snapshot_id` the current latest snapshot is used.
    pub(crate) async fn attempt_failed_locked(
        &self,
        run_id: Uuid,
        snapshot_id: Option<Uuid>,
        failure: AttemptFailure,
        worker: &WorkerIdentity,
        force_requeue: bool,
    ) -> EngineResult<WithFollowUp<CompleteRunAttemptResult>> {
        let latest = match snapshot_id {
            Some(snapshot_id) => self.snapshots.assert_latest(run_id, snapshot_id).await?,
            None => self.snapshots.get_latest_execution_snapshot(run_id).await?,
        };
        let mut run = self.resources.get_run(run_id).await?;

        match latest.execution_status {
            TaskRunExecutionStatus::PendingCancel => {
                let snapshot = self.finalize_pending_cancel(&mut run, worker).await?;
                return Ok((
                    finished_result(AttemptStatus::RunFinished, &run, snapshot),
                    Some(run),
                ));
            }
            status if status.is_executing() => {}
            other => return Err(EngineError::invalid_state(run_id, other, "attemptFailed")),
        }

        let now = Utc::now();
        let outcome = retry_outcome_from_completion(RetryOutcomeParams {
            run: &run,
            error: &failure.error,
            retry: failure.retry.as_ref(),
            skipped_retrying: failure.skipped_retrying,
            attempt_number: run.attempt_number,
            default_options: &self.resources.config.retry.default_options,
            now,
        });

        match outcome {
            RetryOutcome::CancelRun { reason } => {
                let request = CancelRunRequest {
                    run_id,
                    reason,
                    completed_at: Some(now),
                    finalize_run: true,
                };
                let (result, finished) = self.cancel_run_locked(request, worker).await?;
                Ok((
                    finished_result(AttemptStatus::RunFinished, &result.run, result.snapshot),
                    finished,
                ))
            }
            RetryOutcome::FailRun {
                sanitized_error, ..
            } => {
                let snapshot = self
                    .fail_run(&mut run, sanitized_error, failure.metadata, worker, now)
                    .await?;
                Ok((
                    finished_result(AttemptStatus::RunFinished, &run, snapshot),
                    Some(run),
                ))
            }
            RetryOutcome::Retry {
                retry_at,
                delay_ms,
                machine,
                sanitized_error,
                ..
            } => {
                let mut tx = StoreTransaction::new();
                tx.push(StoreWrite::DeleteBlockers { run_id });
                stage_run_update(
                    &mut tx,
                    &mut run,
                    RunUpdate {
                        status: Some(TaskRunStatus::RetryingAfterFailure),
                        error: Some(sanitized_error.clone()),
                        machine_preset: machine.clone(),
                        metadata: failure.metadata.clone(),
                        ..Default::default()
                    },
                    now,
                );
                if let Some(metadata) = failure.metadata {
                    tx.emit(EngineEvent::RunMetadataUpdated { run_id, metadata });
                }
                tx.emit(EngineEvent::RunRetryScheduled {
                    run_id,
                    attempt_number: run.attempt_number,
                    retry_at,
                    delay_ms,
                    machine,
                });

                let cold = force_requeue
                    || latest.execution_status == TaskRunExecutionStatus::PendingExecuting
                    || delay_ms > self.resources.config.retry.warm_start_threshold_ms;

                if !cold {
                    let snapshot = self.snapshots.create_execution_snapshot(
                        &mut tx,
                        &mut run,
                        SnapshotInput::new(
                            TaskRunExecutionStatus::Executing,
                            "Attempt failed, retrying in place",
                        )
                        .with_worker(worker)
                        .with_error(sanitized_error.message()),
                    );
                    tx.emit(EngineEvent::WorkerNotification {
                        run_id,
                        snapshot_id: snapshot.id,
                        execution_status: snapshot.execution_status,
                    });
                    self.resources.commit(tx).await?;
                    info!(run_id = %run_id, delay_ms, "Attempt failed, retrying warm");
                    return Ok((
                        finished_result(AttemptStatus::RetryImmediately, &run, snapshot),
                        None,
                    ));
                }

                let snapshot = self.snapshots.create_execution_snapshot(
                    &mut tx,
                    &mut run,
                    SnapshotInput::new(
                        TaskRunExecutionStatus::Queued,
                        "Attempt failed, run was requeued for retry",
                    )
                    .with_worker(worker)
                    .with_error(sanitized_error.message()),
                );
                self.resources.commit(tx).await?;

                let requeue_failure = match self
                    .resources
                    .run_queue
                    .requeue_for_retry(run.organization_id, run_id, retry_at)
                    .await
                {
                    Ok(true) => None,
                    Ok(false) => Some("Run could not be requeued for retry".to_string()),
                    Err(e) => {
                        log_error(
                            "RunAttemptSystem",
                            "attempt_failed",
                            &e.to_string(),
                            Some(&format!("run {run_id}")),
                        );
                        Some(format!("Run could not be requeued for retry: {e}"))
                    }
                };
                if let Some(message) = requeue_failure {
                    warn!(run_id = %run_id, "Run could not be requeued for retry, failing it");
                    let error = TaskRunError::internal(
                        TaskRunErrorCode::TaskRunDequeuedMaxRetries,
                        message,
                    );
                    let snapshot = self.fail_run(&mut run, error, None, worker, Utc::now()).await?;
                    return Ok((
                        finished_result(AttemptStatus::RunFinished, &run, snapshot),
                        Some(run),
                    ));
                }

                info!(run_id = %run_id, delay_ms, retry_at = %retry_at, "Attempt failed, run requeued");
                Ok((
                    finished_result(AttemptStatus::RetryQueued, &run, snapshot),
                    None,
                ))
            }
        }
    }

    #[instrument(skip(self, request), fields(run_id = %request.run_id))]
    pub async fn cancel_run(&self, request: CancelRunRequest) -> EngineResult<ExecutionResult> {
        let run_id = request.run_id;
        let (result, finished) = self
            .resources
            .lock_run("cancelRun", run_id, move || async move {
                self.cancel_run_locked(request, &WorkerIdentity::default())
                    .await
            })
            .await?;

        if let Some(run) = finished {
            self.after_run_finished(&run).await?;
        }
        Ok(result)
    }

    pub(crate) async fn cancel_run_locked(
        &self,
        request: CancelRunRequest,
        worker: &WorkerIdentity,
    ) -> EngineResult<WithFollowUp<ExecutionResult>> {
        let run_id = request.run_id;
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        let mut run = self.resources.get_run(run_id).await?;

        match latest.execution_status {
            TaskRunExecutionStatus::Finished => {
                return Ok((ExecutionResult { run, snapshot: latest }, None));
            }
            TaskRunExecutionStatus::PendingCancel => {
                self.resources.events.publish(EngineEvent::WorkerNotification {
                    run_id,
                    snapshot_id: latest.id,
                    execution_status: latest.execution_status,
                });
                return Ok((ExecutionResult { run, snapshot: latest }, None));
            }
            _ => {}
        }

        let now = request.completed_at.unwrap_or_else(Utc::now);
        let reason = request
            .reason
            .unwrap_or_else(|| "Run was cancelled".to_string());

        if latest.execution_status.is_executing() && !request.finalize_run {
            let mut tx = StoreTransaction::new();
            stage_run_update(
                &mut tx,
                &mut run,
                RunUpdate {
                    status: Some(TaskRunStatus::Canceled),
                    error: Some(TaskRunError::string(reason.clone())),
                    completed_at: Some(now),
                    ..Default::default()
                },
                now,
            );
            let snapshot = self.snapshots.create_execution_snapshot(
                &mut tx,
                &mut run,
                SnapshotInput::new(
                    TaskRunExecutionStatus::PendingCancel,
                    "Run was cancelled while executing",
                )
                .with_worker(worker)
                .with_error(reason),
            );
            tx.emit(EngineEvent::WorkerNotification {
                run_id,
                snapshot_id: snapshot.id,
                execution_status: snapshot.execution_status,
            });
            self.resources.commit(tx).await?;
            self.resources
                .run_queue
                .acknowledge_message(run.organization_id, run_id)
                .await?;

            log_run_operation("cancelRun", run_id, Some(snapshot.id), "PENDING_CANCEL", None);
            return Ok((ExecutionResult { run, snapshot }, None));
        }

        let snapshot = self.finalize_cancel(&mut run, reason, now, worker).await?;
        Ok((
            ExecutionResult {
                run: run.clone(),
                snapshot,
            },
            Some(run),
        ))
    }

    /// Finish a run whose cancellation was waiting for its worker.
    pub(crate) async fn finalize_pending_cancel(
        &self,
        run: &mut TaskRun,
        worker: &WorkerIdentity,
    ) -> EngineResult<ExecutionSnapshot> {
        let reason = run
            .error
            .as_ref()
            .map(TaskRunError::message)
            .unwrap_or_else(|| "Run was cancelled".to_string());
        let completed_at = run.completed_at.unwrap_or_else(Utc::now);
        self.finalize_cancel(run, reason, completed_at, worker).await
    }

    /// Finish a PENDING_CANCEL run when its snapshot is still `snapshot_id`.
    pub async fn finalize_cancel_if_pending(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
    ) -> EngineResult<ExecutionResult> {
        let (result, finished) = self
            .resources
            .lock_run("finalizeCancel", run_id, move || async move {
                let latest = self.snapshots.assert_latest(run_id, snapshot_id).await?;
                let mut run = self.resources.get_run(run_id).await?;
                if latest.execution_status != TaskRunExecutionStatus::PendingCancel {
                    return Ok((ExecutionResult { run, snapshot: latest }, None));
                }
                let snapshot = self
                    .finalize_pending_cancel(&mut run, &WorkerIdentity::default())
                    .await?;
                Ok((
                    ExecutionResult {
                        run: run.clone(),
                        snapshot,
                    },
                    Some(run),
                ))
            })
            .await?;

        if let Some(run) = finished {
            self.after_run_finished(&run).await?;
        }
        Ok(result)
    }

    async fn finalize_cancel(
        &self,
        run: &mut TaskRun,
        reason: String,
        completed_at: DateTime<Utc>,
        worker: &WorkerIdentity,
    ) -> EngineResult<ExecutionSnapshot> {
        let children = self.resources.store.find_child_runs(run.id).await?;

        let mut tx = StoreTransaction::new();
        let snapshot = self.stage_finish_run(
            &mut tx,
            run,
            RunFinish::failed(
                TaskRunStatus::Canceled,
                TaskRunError::string(reason.clone()),
                "Run was cancelled",
                completed_at,
            ),
            worker,
        );
        for child in children.iter().filter(|child| !child.is_final()) {
            tx.schedule_job(
                EngineJob::CancelRun {
                    run_id: child.id,
                    reason: Some(format!("Parent run {} was cancelled", run.friendly_id)),
                    completed_at,
                    finalize_run: false,
                },
                Utc::now(),
            );
        }
        tx.emit(EngineEvent::RunCancelled {
            run_id: run.id,
            reason: Some(reason),
            completed_at,
        });
        self.resources.commit(tx).await?;

        log_run_operation(
            "cancelRun",
            run.id,
            Some(snapshot.id),
            run.status.as_str(),
            Some(&format!("{} child runs scheduled for cancellation", children.len())),
        );
        Ok(snapshot)
    }

    /// Put a run back into its queue, failing it if the queue refuses.
    #[instrument(skip(self, error))]
    pub async fn try_nack_and_requeue(
        &self,
        run_id: Uuid,
        snapshot_id: Option<Uuid>,
        error: TaskRunError,
    ) -> EngineResult<ExecutionResult> {
        let (result, finished) = self
            .resources
            .lock_run("tryNackAndRequeue", run_id, move || async move {
                let latest = match snapshot_id {
                    Some(snapshot_id) => self.snapshots.assert_latest(run_id, snapshot_id).await?,
                    None => self.snapshots.get_latest_execution_snapshot(run_id).await?,
                };
                let mut run = self.resources.get_run(run_id).await?;
                match latest.execution_status {
                    TaskRunExecutionStatus::Finished => {
                        return Ok((ExecutionResult { run, snapshot: latest }, None));
                    }
                    TaskRunExecutionStatus::PendingCancel => {
                        let snapshot = self
                            .finalize_pending_cancel(&mut run, &WorkerIdentity::default())
                            .await?;
                        return Ok((
                            ExecutionResult {
                                run: run.clone(),
                                snapshot,
                            },
                            Some(run),
                        ));
                    }
                    _ => {}
                }

                let now = Utc::now();
                let mut tx = StoreTransaction::new();
                if matches!(
                    run.status,
                    TaskRunStatus::Executing | TaskRunStatus::ExecutingWithWaitpoints
                ) {
                    stage_run_update(&mut tx, &mut run, RunUpdate::status(TaskRunStatus::Pending), now);
                }
                let snapshot = self.snapshots.create_execution_snapshot(
                    &mut tx,
                    &mut run,
                    SnapshotInput::new(TaskRunExecutionStatus::Queued, "Run was requeued")
                        .with_error(error.message()),
                );
                self.resources.commit(tx).await?;

                let requeued = self
                    .resources
                    .run_queue
                    .nack_message(run.organization_id, run_id, None)
                    .await;
                let reason = match requeued {
                    Ok(true) => {
                        log_run_operation("tryNackAndRequeue", run_id, Some(snapshot.id), "QUEUED", None);
                        return Ok((ExecutionResult { run, snapshot }, None));
                    }
                    Ok(false) => error.message(),
                    Err(e) => {
                        log_error(
                            "RunAttemptSystem",
                            "try_nack_and_requeue",
                            &e.to_string(),
                            Some(&format!("run {run_id}")),
                        );
                        format!("{}: {e}", error.message())
                    }
                };

                warn!(run_id = %run_id, "Run could not be requeued, treating as system failure");
                let failure = TaskRunError::internal(
                    TaskRunErrorCode::TaskRunDequeuedMaxRetries,
                    format!("Run could not be requeued: {reason}"),
                );
                let snapshot = self
                    .fail_run(&mut run, failure, None, &WorkerIdentity::default(), Utc::now())
                    .await?;
                Ok((
                    ExecutionResult {
                        run: run.clone(),
                        snapshot,
                    },
                    Some(run),
                ))
            })
            .await?;

        if let Some(run) = finished {
            self.after_run_finished(&run).await?;
        }
        Ok(result)
    }

    /// Entry point for failures detected by the platform rather than reported
    /// by a worker.
    #[instrument(skip(self, error))]
    pub async fn system_failure(
        &self,
        run_id: Uuid,
        error: TaskRunError,
    ) -> EngineResult<ExecutionResult> {
        let (result, finished) = self
            .resources
            .lock_run("systemFailure", run_id, move || async move {
                let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
                if latest.execution_status == TaskRunExecutionStatus::Finished {
                    let run = self.resources.get_run(run_id).await?;
                    return Ok((ExecutionResult { run, snapshot: latest }, None));
                }

                let worker = WorkerIdentity::default();
                if latest.execution_status.is_executing()
                    || latest.execution_status == TaskRunExecutionStatus::PendingCancel
                {
                    let (result, finished) = self
                        .attempt_failed_locked(run_id, None, AttemptFailure::new(error), &worker, true)
                        .await?;
                    return Ok((
                        ExecutionResult {
                            run: result.run,
                            snapshot: result.snapshot,
                        },
                        finished,
                    ));
                }

                let mut run = self.resources.get_run(run_id).await?;
                let snapshot = self.fail_run(&mut run, error, None, &worker, Utc::now()).await?;
                Ok((
                    ExecutionResult {
                        run: run.clone(),
                        snapshot,
                    },
                    Some(run),
                ))
            })
            .await?;

        if let Some(run) = finished {
            self.after_run_finished(&run).await?;
        }
        Ok(result)
    }

    /// Permanently fail a run, classifying platform failures as
    /// SYSTEM_FAILURE.
    async fn fail_run(
        &self,
        run: &mut TaskRun,
        error: TaskRunError,
        metadata: Option<Value>,
        worker: &WorkerIdentity,
        now: DateTime<Utc>,
    ) -> EngineResult<ExecutionSnapshot> {
        let status = if error
            .internal_code()
            .is_some_and(|code| code.is_system_failure())
        {
            TaskRunStatus::SystemFailure
        } else {
            TaskRunStatus::CompletedWithErrors
        };

        let mut tx = StoreTransaction::new();
        let mut finish = RunFinish::failed(status, error.clone(), "Run failed", now);
        finish.metadata = metadata;
        let snapshot = self.stage_finish_run(&mut tx, run, finish, worker);
        tx.emit(EngineEvent::RunFailed {
            run_id: run.id,
            status,
            error,
            completed_at: now,
        });
        self.resources.commit(tx).await?;

        log_run_operation("failRun", run.id, Some(snapshot.id), status.as_str(), None);
        Ok(snapshot)
    }

    /// Stage everything that finishing a run entails: the terminal run
    /// update, the FINISHED snapshot, detaching its blockers, completing its
    /// waitpoint and cancelling its pending jobs.
    pub(crate) fn stage_finish_run(
        &self,
        tx: &mut StoreTransaction,
        run: &mut TaskRun,
        finish: RunFinish,
        worker: &WorkerIdentity,
    ) -> ExecutionSnapshot {
        let run_id = run.id;
        let now = Utc::now();
        stage_run_update(
            tx,
            run,
            RunUpdate {
                status: Some(finish.status),
                output: output_value(finish.output.as_deref(), finish.output_type.as_deref()),
                output_type: finish.output.as_ref().and(finish.output_type.clone()),
                error: finish.error.clone(),
                metadata: finish.metadata.clone(),
                completed_at: Some(finish.completed_at),
                expired_at: (finish.status == TaskRunStatus::Expired).then_some(finish.completed_at),
                ..Default::default()
            },
            now,
        );
        tx.push(StoreWrite::DeleteBlockers { run_id });

        let mut input = SnapshotInput::new(TaskRunExecutionStatus::Finished, finish.description)
            .with_worker(worker);
        if let Some(error) = &finish.error {
            input = input.with_error(error.message());
        }
        let snapshot = self.snapshots.create_execution_snapshot(tx, run, input);

        if let Some(waitpoint_id) = run.associated_waitpoint_id {
            tx.push(StoreWrite::CompleteWaitpoint {
                waitpoint_id,
                output: WaitpointSystem::output_for_finished_run(run),
                completed_at: finish.completed_at,
            });
        }
        tx.ack_job(expire_job_id(&run_id));
        tx.ack_job(delayed_job_id(&run_id));
        if let Some(batch_id) = run.batch_id {
            tx.schedule_job(EngineJob::TryCompleteBatch { batch_id }, now);
        }
        if let Some(metadata) = finish.metadata {
            tx.emit(EngineEvent::RunMetadataUpdated { run_id, metadata });
        }
        snapshot
    }

    /// Follow-up once a finished run's lock is released: drop it from the
    /// queue and resume whoever waits on it.
    pub(crate) async fn after_run_finished(&self, run: &TaskRun) -> EngineResult<()> {
        self.resources
            .run_queue
            .acknowledge_message(run.organization_id, run.id)
            .await?;
        if let Some(waitpoint_id) = run.associated_waitpoint_id {
            self.waitpoints.resume_blocked_runs(waitpoint_id).await?;
        }
        Ok(())
    }
}

fn finished_result(
    attempt_status: AttemptStatus,
    run: &TaskRun,
    snapshot: ExecutionSnapshot,
) -> CompleteRunAttemptResult {
    CompleteRunAttemptResult {
        attempt_status,
        run: run.clone(),
        snapshot,
    }
}
