//! # Run Engine
//!
//! [`RunEngine`] wires the coordination systems together around one set of
//! [`SystemResources`] and is the procedural API for workers, trigger paths
//! and presentation layers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use run_engine::config::EngineConfig;
//! use run_engine::engine::{RunEngine, TriggerRequest};
//! use run_engine::models::{AuthenticatedEnvironment, RuntimeEnvironmentType};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = RunEngine::in_memory(EngineConfig::default());
//! let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Development);
//!
//! let run = engine
//!     .trigger(TriggerRequest::new(env, "send-email", serde_json::json!({"to": "a@b.c"})))
//!     .await?;
//! let dequeued = engine.dequeue_from_master_queue("worker-1", &run.master_queue, 10).await?;
//! println!("dequeued {} runs", dequeued.len());
//! engine.quit().await?;
//! # Ok(())
//! # }
//! ```

pub mod batch_system;
pub mod delayed_run_system;
pub mod dequeue_system;
pub mod enqueue_system;
pub mod execution_snapshot_system;
pub mod heartbeat_system;
pub mod release_concurrency_system;
pub mod resources;
pub mod run_attempt_system;
pub mod trigger_system;
pub mod ttl_system;
pub mod waitpoint_system;

pub use batch_system::{
    BatchItemError, BatchItemProcessor, BatchRequest, BatchSystem, TriggerBatchItems,
};
pub use delayed_run_system::DelayedRunSystem;
pub use dequeue_system::DequeueSystem;
pub use enqueue_system::EnqueueSystem;
pub use execution_snapshot_system::{ExecutionSnapshotSystem, SnapshotInput};
pub use heartbeat_system::HeartbeatSystem;
pub use release_concurrency_system::ReleaseConcurrencySystem;
pub use resources::SystemResources;
pub use run_attempt_system::{AttemptFailure, RunAttemptSystem};
pub use trigger_system::{TriggerRequest, TriggerSystem};
pub use ttl_system::TtlSystem;
pub use waitpoint_system::WaitpointSystem;

use crate::config::EngineConfig;
use crate::constants::JOB_VISIBILITY_TIMEOUT_MS;
use crate::error::EngineResult;
use crate::events::{EventPublisher, PublishedEvent};
use crate::locking::{LockBackend, RunLocker};
use crate::models::{
    AuthenticatedEnvironment, BatchInfo, BatchItemOutcome, BatchTaskRun, CancelRunRequest,
    CompleteRunAttemptResult, CompletedWaitpoint, DequeuedMessage, ExecutionResult,
    ExecutionSnapshot, RunExecutionData, StartRunAttemptResult, TaskRun, TaskRunError,
    TaskRunExecutionResult, Waitpoint, WaitpointOutput, WorkerIdentity,
};
use crate::run_queue::{QueueBackend, RunQueue};
use crate::store::{EngineStore, MemoryEngineStore};
use crate::worker::{EngineJob, EngineWorker, JobHandler, JobScheduler, ProcessJobsResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// How long [`RunEngine::quit`] waits for the job loop to stop.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordination core for runs: triggering, dequeueing, attempts, waitpoints,
/// batches and the scheduled jobs behind delays, TTLs and heartbeats.
#[derive(Debug)]
pub struct RunEngine {
    resources: Arc<SystemResources>,
    snapshots: Arc<ExecutionSnapshotSystem>,
    waitpoints: Arc<WaitpointSystem>,
    attempts: Arc<RunAttemptSystem>,
    delayed: Arc<DelayedRunSystem>,
    ttl: Arc<TtlSystem>,
    dequeue: DequeueSystem,
    batches: BatchSystem,
    heartbeats: HeartbeatSystem,
    triggers: TriggerSystem,
    worker: Arc<EngineWorker>,
}

impl RunEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn EngineStore>,
        run_queue: RunQueue,
        run_lock: RunLocker,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let jobs = JobScheduler::new(
            run_queue.backend().clone(),
            run_queue.keys().clone(),
            Duration::from_millis(JOB_VISIBILITY_TIMEOUT_MS),
        );
        let events = EventPublisher::new(config.events.channel_capacity);
        let resources = Arc::new(SystemResources::new(
            store,
            run_queue,
            run_lock,
            jobs.clone(),
            events,
            config.clone(),
        ));

        let snapshots = Arc::new(ExecutionSnapshotSystem::new(resources.clone()));
        let release_concurrency = Arc::new(ReleaseConcurrencySystem::new(resources.clone()));
        let enqueue = Arc::new(EnqueueSystem::new(resources.clone(), snapshots.clone()));
        let waitpoints = Arc::new(WaitpointSystem::new(
            resources.clone(),
            snapshots.clone(),
            release_concurrency,
        ));
        let attempts = Arc::new(RunAttemptSystem::new(
            resources.clone(),
            snapshots.clone(),
            waitpoints.clone(),
        ));
        let ttl = Arc::new(TtlSystem::new(
            resources.clone(),
            snapshots.clone(),
            attempts.clone(),
        ));
        let delayed = Arc::new(DelayedRunSystem::new(
            resources.clone(),
            snapshots.clone(),
            enqueue.clone(),
            ttl.clone(),
        ));
        let dequeue = DequeueSystem::new(resources.clone(), snapshots.clone());
        let batches = BatchSystem::new(resources.clone(), waitpoints.clone());
        let heartbeats = HeartbeatSystem::new(resources.clone(), snapshots.clone(), attempts.clone());
        let triggers = TriggerSystem::new(
            resources.clone(),
            snapshots.clone(),
            enqueue,
            waitpoints.clone(),
            delayed.clone(),
            ttl.clone(),
        );

        Arc::new_cyclic(|engine: &Weak<RunEngine>| {
            let handler: Weak<dyn JobHandler> = engine.clone();
            let worker = Arc::new(EngineWorker::new(jobs, handler, config.worker.clone()));
            Self {
                resources,
                snapshots,
                waitpoints,
                attempts,
                delayed,
                ttl,
                dequeue,
                batches,
                heartbeats,
                triggers,
                worker,
            }
        })
    }

    /// Engine over the in-memory store, queue and lock backends.
    pub fn in_memory(config: EngineConfig) -> Arc<Self> {
        let run_queue = RunQueue::in_memory(config.queue.clone());
        let run_lock = RunLocker::in_memory(run_queue.keys().clone(), &config.run_lock);
        Self::new(config, Arc::new(MemoryEngineStore::new()), run_queue, run_lock)
    }

    /// Engine over the backends named by `config`: PostgreSQL when a database
    /// URL is configured, Redis for the queue and lock when their URLs are
    /// set, in-memory otherwise. Starts the job worker when enabled.
    pub async fn connect(config: EngineConfig) -> EngineResult<Arc<Self>> {
        config.validate()?;

        let store = connect_store(&config).await?;
        let run_queue = RunQueue::new(
            config.queue.clone(),
            connect_queue_backend(&config).await?,
            Arc::new(crate::run_queue::WeightedAgeCapacityStrategy::default()),
        );
        let run_lock = RunLocker::new(
            connect_lock_backend(&config).await?,
            run_queue.keys().clone(),
            &config.run_lock,
        );

        let start_worker = config.worker.enabled;
        let engine = Self::new(config, store, run_queue, run_lock);
        if start_worker {
            engine.start_worker().await?;
        }
        info!(
            queue_backend = engine.resources.run_queue.backend().provider_name(),
            "Run engine connected"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.resources.config
    }

    pub fn run_queue(&self) -> &RunQueue {
        &self.resources.run_queue
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.resources.store
    }

    pub fn events(&self) -> &EventPublisher {
        &self.resources.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.resources.events.subscribe()
    }

    pub fn jobs(&self) -> &JobScheduler {
        &self.resources.jobs
    }

    // Trigger and dequeue

    pub async fn trigger(&self, request: TriggerRequest) -> EngineResult<TaskRun> {
        self.triggers.trigger(request).await
    }

    pub async fn dequeue_from_master_queue(
        &self,
        consumer_id: &str,
        master_queue: &str,
        max_runs: usize,
    ) -> EngineResult<Vec<DequeuedMessage>> {
        self.dequeue
            .dequeue_from_master_queue(consumer_id, master_queue, max_runs)
            .await
    }

    // Attempts

    pub async fn start_run_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        worker: WorkerIdentity,
        is_warm_start: bool,
    ) -> EngineResult<StartRunAttemptResult> {
        self.attempts
            .start_run_attempt(run_id, snapshot_id, worker, is_warm_start)
            .await
    }

    pub async fn complete_run_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completion: TaskRunExecutionResult,
        worker: WorkerIdentity,
    ) -> EngineResult<CompleteRunAttemptResult> {
        self.attempts
            .complete_run_attempt(run_id, snapshot_id, completion, worker)
            .await
    }

    pub async fn cancel_run(&self, request: CancelRunRequest) -> EngineResult<ExecutionResult> {
        self.attempts.cancel_run(request).await
    }

    pub async fn try_nack_and_requeue(
        &self,
        run_id: Uuid,
        snapshot_id: Option<Uuid>,
        error: TaskRunError,
    ) -> EngineResult<ExecutionResult> {
        self.attempts
            .try_nack_and_requeue(run_id, snapshot_id, error)
            .await
    }

    pub async fn system_failure(&self, run_id: Uuid, error: TaskRunError) -> EngineResult<ExecutionResult> {
        self.attempts.system_failure(run_id, error).await
    }

    pub async fn heartbeat_run(&self, run_id: Uuid, snapshot_id: Uuid) -> EngineResult<ExecutionSnapshot> {
        self.heartbeats.heartbeat_run(run_id, snapshot_id).await
    }

    // Delays and TTL

    pub async fn reschedule_delayed_run(
        &self,
        run_id: Uuid,
        delay_until: DateTime<Utc>,
    ) -> EngineResult<ExecutionResult> {
        self.delayed.reschedule_delayed_run(run_id, delay_until).await
    }

    pub async fn expire_run(&self, run_id: Uuid) -> EngineResult<()> {
        self.ttl.expire_run(run_id).await
    }

    // Waitpoints

    pub async fn get_or_create_run_waitpoint(&self, run_id: Uuid) -> EngineResult<Waitpoint> {
        self.waitpoints.get_or_create_run_waitpoint(run_id).await
    }

    pub async fn complete_waitpoint(
        &self,
        waitpoint_id: Uuid,
        output: WaitpointOutput,
    ) -> EngineResult<Waitpoint> {
        self.waitpoints.complete_waitpoint(waitpoint_id, output).await
    }

    pub async fn block_run_with_waitpoint(
        &self,
        run_id: Uuid,
        waitpoint_ids: &[Uuid],
        batch: Option<BatchInfo>,
    ) -> EngineResult<ExecutionSnapshot> {
        self.waitpoints
            .block_run_with_waitpoint(run_id, waitpoint_ids, batch)
            .await
    }

    pub async fn continue_run_if_unblocked(&self, run_id: Uuid) -> EngineResult<Option<ExecutionSnapshot>> {
        self.waitpoints.continue_run_if_unblocked(run_id).await
    }

    pub async fn clear_blocking_waitpoints(&self, run_id: Uuid) -> EngineResult<()> {
        self.waitpoints.clear_blocking_waitpoints(run_id).await
    }

    pub async fn create_date_time_waitpoint(
        &self,
        environment: &AuthenticatedEnvironment,
        completed_after: DateTime<Utc>,
        idempotency_key: Option<String>,
    ) -> EngineResult<Waitpoint> {
        self.waitpoints
            .create_date_time_waitpoint(environment, completed_after, idempotency_key)
            .await
    }

    pub async fn create_manual_waitpoint(
        &self,
        environment: &AuthenticatedEnvironment,
        idempotency_key: Option<String>,
    ) -> EngineResult<Waitpoint> {
        self.waitpoints
            .create_manual_waitpoint(environment, idempotency_key)
            .await
    }

    // Batches

    pub async fn initialize_batch(&self, request: BatchRequest) -> EngineResult<BatchTaskRun> {
        self.batches.initialize_batch(request).await
    }

    /// Process one batch item and record its outcome. A failing item is
    /// recorded as such; it never fails the call.
    #[instrument(skip(self, processor))]
    pub async fn enqueue_batch_item(
        &self,
        batch_id: Uuid,
        index: u32,
        processor: &dyn BatchItemProcessor,
    ) -> EngineResult<BatchTaskRun> {
        let batch = self.batches.get_batch(batch_id).await?;
        let outcome = match processor.process_item(self, &batch, index).await {
            Ok(run_id) => BatchItemOutcome::Triggered { run_id },
            Err(e) => {
                warn!(batch_id = %batch_id, index, error = %e.error, "Batch item failed to trigger");
                BatchItemOutcome::Failed {
                    error: e.error,
                    error_code: e.error_code,
                }
            }
        };
        self.batches.record_batch_item(batch_id, index, outcome).await
    }

    pub async fn try_complete_batch(&self, batch_id: Uuid) -> EngineResult<Option<BatchTaskRun>> {
        self.batches.try_complete_batch(batch_id).await
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> EngineResult<BatchTaskRun> {
        self.batches.get_batch(batch_id).await
    }

    // Reads

    pub async fn get_run(&self, run_id: Uuid) -> EngineResult<TaskRun> {
        self.resources.get_run(run_id).await
    }

    pub async fn get_latest_execution_snapshot(&self, run_id: Uuid) -> EngineResult<ExecutionSnapshot> {
        self.snapshots.get_latest_execution_snapshot(run_id).await
    }

    pub async fn get_snapshots_since(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
    ) -> EngineResult<Vec<ExecutionSnapshot>> {
        self.snapshots.get_snapshots_since(run_id, snapshot_id).await
    }

    /// Latest state of a run with the outputs of the waitpoints its latest
    /// snapshot resumed with.
    pub async fn get_run_execution_data(&self, run_id: Uuid) -> EngineResult<RunExecutionData> {
        let run = self.resources.get_run(run_id).await?;
        let snapshot = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        let waitpoints = self
            .resources
            .store
            .find_waitpoints(&snapshot.completed_waitpoint_ids())
            .await?;

        let completed_waitpoints = snapshot
            .completed_waitpoints
            .iter()
            .filter_map(|completed| {
                waitpoints
                    .iter()
                    .find(|w| w.id == completed.waitpoint_id)
                    .map(|w| CompletedWaitpoint::from_waitpoint(w, completed.batch_index))
            })
            .collect();

        Ok(RunExecutionData {
            run_id,
            friendly_id: run.friendly_id.clone(),
            run_status: run.status,
            attempt_number: run.attempt_number,
            batch: run.batch_id.map(|id| BatchInfo {
                id,
                index: run.batch_index,
            }),
            snapshot,
            completed_waitpoints,
        })
    }

    // Lifecycle

    /// Run every due scheduled job once.
    pub async fn process_due_jobs(&self) -> EngineResult<ProcessJobsResult> {
        self.worker.process_due_jobs().await
    }

    pub async fn start_worker(&self) -> EngineResult<()> {
        self.worker.start().await
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop the job worker and close the queue backend.
    pub async fn quit(&self) -> EngineResult<()> {
        self.worker.quit(WORKER_SHUTDOWN_TIMEOUT).await?;
        self.resources.run_queue.quit().await?;
        info!("Run engine stopped");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for RunEngine {
    async fn handle_job(&self, job: &EngineJob) -> anyhow::Result<()> {
        match job {
            EngineJob::ContinueRunIfUnblocked { run_id } => {
                self.waitpoints.continue_run_if_unblocked(*run_id).await?;
            }
            EngineJob::CancelRun {
                run_id,
                reason,
                completed_at,
                finalize_run,
            } => {
                self.attempts
                    .cancel_run(CancelRunRequest {
                        run_id: *run_id,
                        reason: reason.clone(),
                        completed_at: Some(*completed_at),
                        finalize_run: *finalize_run,
                    })
                    .await?;
            }
            EngineJob::TryCompleteBatch { batch_id } => {
                self.batches.try_complete_batch(*batch_id).await?;
            }
            EngineJob::EnqueueDelayedRun { run_id } => {
                self.delayed.enqueue_delayed_run(*run_id).await?;
            }
            EngineJob::ExpireRun { run_id } => {
                self.ttl.expire_run(*run_id).await?;
            }
            EngineJob::HeartbeatSnapshot {
                run_id,
                snapshot_id,
            } => {
                self.heartbeats
                    .handle_heartbeat_timeout(*run_id, *snapshot_id)
                    .await?;
            }
            EngineJob::FinishDateTimeWaitpoint { waitpoint_id } => {
                self.waitpoints
                    .finish_date_time_waitpoint(*waitpoint_id)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
async fn connect_store(config: &EngineConfig) -> EngineResult<Arc<dyn EngineStore>> {
    #[cfg(feature = "postgres")]
    {
        if config.database.database_url().is_some() {
            let store = crate::store::PgEngineStore::connect(&config.database).await?;
            store.migrate().await?;
            return Ok(Arc::new(store));
        }
    }
    Ok(Arc::new(MemoryEngineStore::new()))
}

#[cfg_attr(not(feature = "redis-queue"), allow(unused_variables))]
async fn connect_queue_backend(config: &EngineConfig) -> EngineResult<QueueBackend> {
    #[cfg(feature = "redis-queue")]
    {
        if let Some(url) = &config.queue.redis_url {
            return QueueBackend::redis(url).await;
        }
    }
    Ok(QueueBackend::memory())
}

#[cfg_attr(not(feature = "redis-lock"), allow(unused_variables))]
async fn connect_lock_backend(config: &EngineConfig) -> EngineResult<LockBackend> {
    #[cfg(feature = "redis-lock")]
    {
        if let Some(url) = &config.run_lock.redis_url {
            return LockBackend::redis(url, &config.run_lock).await;
        }
    }
    Ok(LockBackend::memory())
}
