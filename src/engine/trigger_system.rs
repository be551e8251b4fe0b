//! Creating runs: the first snapshots, the queue message or delay job, the
//! TTL, and blocking the parent when it waits on the new run.

use super::delayed_run_system::DelayedRunSystem;
use super::enqueue_system::EnqueueSystem;
use super::execution_snapshot_system::{ExecutionSnapshotSystem, SnapshotInput};
use super::resources::SystemResources;
use super::ttl_system::TtlSystem;
use super::waitpoint_system::WaitpointSystem;
use crate::constants::{DEFAULT_MASTER_QUEUE, JSON_OUTPUT_TYPE};
use crate::error::{EngineError, EngineResult};
use crate::logging::log_run_operation;
use crate::models::{
    generate_friendly_id, AuthenticatedEnvironment, BatchInfo, ExecutionSnapshot, TaskRun,
    TaskRunExecutionStatus, TaskRunStatus,
};
use crate::retry::RetryOptions;
use crate::run_queue::KeyProducer;
use crate::store::{StoreTransaction, StoreWrite};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Everything needed to create a run.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub environment: AuthenticatedEnvironment,
    pub task_identifier: String,
    pub payload: Value,
    pub payload_type: String,
    /// Defaults to `task/<task_identifier>`
    pub queue: Option<String>,
    pub concurrency_key: Option<String>,
    pub master_queue: Option<String>,
    pub max_attempts: Option<u32>,
    pub retry_options: Option<RetryOptions>,
    pub machine_preset: Option<String>,
    pub parent_task_run_id: Option<Uuid>,
    pub resume_parent_on_completion: bool,
    pub batch: Option<BatchInfo>,
    pub ttl_ms: Option<u64>,
    pub delay_until: Option<DateTime<Utc>>,
    pub debounce_key: Option<String>,
    pub priority_ms: i64,
    pub metadata: Option<Value>,
}

impl TriggerRequest {
    pub fn new(
        environment: AuthenticatedEnvironment,
        task_identifier: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            environment,
            task_identifier: task_identifier.into(),
            payload,
            payload_type: JSON_OUTPUT_TYPE.to_string(),
            queue: None,
            concurrency_key: None,
            master_queue: None,
            max_attempts: None,
            retry_options: None,
            machine_preset: None,
            parent_task_run_id: None,
            resume_parent_on_completion: false,
            batch: None,
            ttl_ms: None,
            delay_until: None,
            debounce_key: None,
            priority_ms: 0,
            metadata: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn with_master_queue(mut self, master_queue: impl Into<String>) -> Self {
        self.master_queue = Some(master_queue.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_retry_options(mut self, options: RetryOptions) -> Self {
        self.retry_options = Some(options);
        self
    }

    pub fn with_machine(mut self, preset: impl Into<String>) -> Self {
        self.machine_preset = Some(preset.into());
        self
    }

    /// Make this a child run. With `resume_parent` the parent blocks until
    /// the child finishes.
    pub fn with_parent(mut self, parent_run_id: Uuid, resume_parent: bool) -> Self {
        self.parent_task_run_id = Some(parent_run_id);
        self.resume_parent_on_completion = resume_parent;
        self
    }

    pub fn in_batch(mut self, batch_id: Uuid, index: u32) -> Self {
        self.batch = Some(BatchInfo {
            id: batch_id,
            index: Some(index),
        });
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn delayed_until(mut self, delay_until: DateTime<Utc>) -> Self {
        self.delay_until = Some(delay_until);
        self
    }

    pub fn with_debounce_key(mut self, key: impl Into<String>) -> Self {
        self.debounce_key = Some(key.into());
        self
    }

    pub fn with_priority_ms(mut self, priority_ms: i64) -> Self {
        self.priority_ms = priority_ms;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Explicit queue, or the task's own queue.
    pub fn queue_name(&self) -> String {
        self.queue
            .clone()
            .unwrap_or_else(|| format!("task/{}", self.task_identifier))
    }
}

#[derive(Debug)]
pub struct TriggerSystem {
    resources: Arc<SystemResources>,
    snapshots: Arc<ExecutionSnapshotSystem>,
    enqueue: Arc<EnqueueSystem>,
    waitpoints: Arc<WaitpointSystem>,
    delayed: Arc<DelayedRunSystem>,
    ttl: Arc<TtlSystem>,
}

impl TriggerSystem {
    pub fn new(
        resources: Arc<SystemResources>,
        snapshots: Arc<ExecutionSnapshotSystem>,
        enqueue: Arc<EnqueueSystem>,
        waitpoints: Arc<WaitpointSystem>,
        delayed: Arc<DelayedRunSystem>,
        ttl: Arc<TtlSystem>,
    ) -> Self {
        Self {
            resources,
            snapshots,
            enqueue,
            waitpoints,
            delayed,
            ttl,
        }
    }

    #[instrument(skip(self, request), fields(task = %request.task_identifier))]
    pub async fn trigger(&self, request: TriggerRequest) -> EngineResult<TaskRun> {
        if request.task_identifier.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "task_identifier must not be empty".to_string(),
            ));
        }
        if request.resume_parent_on_completion && request.parent_task_run_id.is_none() {
            return Err(EngineError::InvalidInput(
                "resume_parent_on_completion requires a parent run".to_string(),
            ));
        }

        if !KeyProducer::is_valid_queue_name(&request.queue_name()) {
            return Err(EngineError::InvalidInput(format!(
                "queue name {:?} must be non-empty and must not contain \":ck:\"",
                request.queue_name()
            )));
        }

        if let Some(run) = self.try_debounce(&request).await? {
            return Ok(run);
        }

        let parent = match request.parent_task_run_id {
            Some(parent_id) => Some(self.resources.get_run(parent_id).await?),
            None => None,
        };

        let waiting_parent = parent
            .as_ref()
            .filter(|_| request.resume_parent_on_completion);
        let (run, snapshot) = match waiting_parent {
            Some(parent) => {
                let parent_id = parent.id;
                let request = &request;
                self.resources
                    .lock_run("trigger", parent_id, move || async move {
                        // Nothing is written unless the parent can wait on the child.
                        self.waitpoints.ensure_blockable(parent_id).await?;
                        let (run, snapshot) = self.create_run(request, Some(parent)).await?;
                        if let Some(waitpoint_id) = run.associated_waitpoint_id {
                            self.waitpoints
                                .block_run_with_waitpoint_locked(
                                    parent_id,
                                    &[waitpoint_id],
                                    request.batch.clone(),
                                )
                                .await?;
                        }
                        Ok((run, snapshot))
                    })
                    .await?
            }
            None => self.create_run(&request, parent.as_ref()).await?,
        };

        log_run_operation(
            "trigger",
            run.id,
            Some(snapshot.id),
            snapshot.execution_status.as_str(),
            Some(&run.friendly_id),
        );
        Ok(run)
    }

    /// Persist a new run with its first snapshots and put it in its queue, or
    /// schedule it when delayed.
    async fn create_run(
        &self,
        request: &TriggerRequest,
        parent: Option<&TaskRun>,
    ) -> EngineResult<(TaskRun, ExecutionSnapshot)> {
        let now = Utc::now();
        let delay_until = request.delay_until.filter(|at| *at > now);
        let mut run = self.build_run(request, parent, delay_until.is_some(), now);

        let waitpoint = parent
            .filter(|_| request.resume_parent_on_completion)
            .map(|_| WaitpointSystem::run_waitpoint(&run));
        run.associated_waitpoint_id = waitpoint.as_ref().map(|w| w.id);

        if request.environment.maximum_concurrency_limit.is_some() {
            self.resources
                .run_queue
                .update_env_concurrency_limits(&request.environment)
                .await?;
        }

        let mut tx = StoreTransaction::new();
        tx.push(StoreWrite::InsertRun(run.clone()));
        if let Some(waitpoint) = &waitpoint {
            tx.push(StoreWrite::InsertWaitpoint(waitpoint.clone()));
        }
        self.snapshots.create_execution_snapshot(
            &mut tx,
            &mut run,
            SnapshotInput::new(TaskRunExecutionStatus::RunCreated, "Run was created"),
        );
        let snapshot = match delay_until {
            Some(delay_until) => {
                self.delayed
                    .stage_delay(&mut tx, &mut run, delay_until, "Run is delayed")
            }
            None => {
                let snapshot = self.enqueue.stage_enqueue(&mut tx, &mut run, "Run was queued");
                self.ttl.stage_ttl(&mut tx, &run);
                snapshot
            }
        };
        self.resources.commit(tx).await?;

        if delay_until.is_none() {
            self.enqueue.enqueue_run(&run).await?;
        }
        Ok((run, snapshot))
    }

    /// Reschedule a still-delayed run with the same debounce key instead of
    /// creating a new one, while it is inside the debounce window.
    async fn try_debounce(&self, request: &TriggerRequest) -> EngineResult<Option<TaskRun>> {
        let (Some(key), Some(delay_until)) = (&request.debounce_key, request.delay_until) else {
            return Ok(None);
        };
        let Some(existing) = self
            .resources
            .store
            .find_debounced_run(request.environment.id, &request.task_identifier, key)
            .await?
        else {
            return Ok(None);
        };

        let window = chrono::Duration::milliseconds(self.resources.config.debounce.max_window_ms as i64);
        if Utc::now() - existing.created_at > window {
            return Ok(None);
        }

        let result = self
            .delayed
            .reschedule_delayed_run(existing.id, delay_until)
            .await?;
        info!(run_id = %existing.id, debounce_key = %key, "Debounced trigger onto existing run");
        Ok(Some(result.run))
    }

    fn build_run(
        &self,
        request: &TriggerRequest,
        parent: Option<&TaskRun>,
        delayed: bool,
        now: DateTime<Utc>,
    ) -> TaskRun {
        let env = &request.environment;
        TaskRun {
            id: Uuid::now_v7(),
            friendly_id: generate_friendly_id("run"),
            task_identifier: request.task_identifier.clone(),
            queue: request.queue_name(),
            concurrency_key: request.concurrency_key.clone(),
            master_queue: request
                .master_queue
                .clone()
                .unwrap_or_else(|| DEFAULT_MASTER_QUEUE.to_string()),
            status: if delayed {
                TaskRunStatus::Delayed
            } else {
                TaskRunStatus::Pending
            },
            attempt_number: 0,
            max_attempts: request.max_attempts,
            retry_options: request.retry_options.clone(),
            machine_preset: request.machine_preset.clone(),
            payload: request.payload.clone(),
            payload_type: request.payload_type.clone(),
            output: None,
            output_type: None,
            error: None,
            metadata: request.metadata.clone(),
            runtime_environment_id: env.id,
            environment_type: env.env_type,
            project_id: env.project_id,
            organization_id: env.organization_id,
            parent_task_run_id: parent.map(|p| p.id),
            root_task_run_id: parent.map(|p| p.root_task_run_id.unwrap_or(p.id)),
            depth: parent.map_or(0, |p| p.depth + 1),
            batch_id: request.batch.as_ref().map(|b| b.id),
            batch_index: request.batch.as_ref().and_then(|b| b.index),
            resume_parent_on_completion: request.resume_parent_on_completion,
            associated_waitpoint_id: None,
            ttl_ms: request.ttl_ms,
            delay_until: request.delay_until.filter(|_| delayed),
            debounce_key: request.debounce_key.clone(),
            priority_ms: request.priority_ms,
            queue_timestamp: (!delayed).then_some(now),
            latest_snapshot_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            executed_at: None,
            completed_at: None,
            expired_at: None,
        }
    }
}
