//! # Batch System
//!
//! A batch fans out into N child runs and fans back in through one batch
//! waitpoint.
//!
//! 1. [`BatchSystem::initialize_batch`] records the batch before any child
//!    exists and, when the parent waits on it, blocks the parent on the
//!    batch waitpoint.
//! 2. Each item is processed by a [`BatchItemProcessor`]; the outcome, a
//!    child run or a structured failure, is recorded per index. When the last
//!    item is recorded the batch is sealed.
//! 3. [`BatchSystem::try_complete_batch`] completes a sealed batch once every
//!    created child run is final. Items that failed to create a run never
//!    hold completion back.

use super::resources::SystemResources;
use super::trigger_system::TriggerRequest;
use super::waitpoint_system::WaitpointSystem;
use super::RunEngine;
use crate::config::BatchZeroSuccessPolicy;
use crate::constants::JSON_OUTPUT_TYPE;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    generate_friendly_id, AuthenticatedEnvironment, BatchInfo, BatchItemOutcome, BatchTaskRun,
    BatchTaskRunItem, BatchTaskRunStatus, BatchUpdate, WaitpointOutput,
};
use crate::store::{StoreTransaction, StoreWrite};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Why an item did not produce a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemError {
    pub error: String,
    pub error_code: Option<String>,
}

impl BatchItemError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_code: None,
        }
    }
}

impl From<EngineError> for BatchItemError {
    fn from(e: EngineError) -> Self {
        Self {
            error: e.to_string(),
            error_code: Some(e.status_code().to_string()),
        }
    }
}

/// Turns one batch item into a child run.
#[async_trait]
pub trait BatchItemProcessor: Send + Sync {
    async fn process_item(
        &self,
        engine: &RunEngine,
        batch: &BatchTaskRun,
        index: u32,
    ) -> Result<Uuid, BatchItemError>;
}

/// Triggers one child per payload from a shared request template.
#[derive(Debug, Clone)]
pub struct TriggerBatchItems {
    pub template: TriggerRequest,
    pub payloads: Vec<Value>,
}

#[async_trait]
impl BatchItemProcessor for TriggerBatchItems {
    async fn process_item(
        &self,
        engine: &RunEngine,
        batch: &BatchTaskRun,
        index: u32,
    ) -> Result<Uuid, BatchItemError> {
        let payload = self
            .payloads
            .get(index as usize)
            .cloned()
            .ok_or_else(|| BatchItemError::new(format!("No payload for batch item {index}")))?;

        let mut request = self.template.clone().in_batch(batch.id, index);
        request.payload = payload;
        if let Some(parent_id) = batch.parent_run_id {
            request = request.with_parent(parent_id, batch.resume_parent_on_completion);
        }
        let run = engine.trigger(request).await?;
        Ok(run.id)
    }
}

/// Input to [`BatchSystem::initialize_batch`].
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub environment: AuthenticatedEnvironment,
    pub run_count: u32,
    pub parent_run_id: Option<Uuid>,
    pub resume_parent_on_completion: bool,
}

fn batch_resource(batch_id: Uuid) -> String {
    format!("batch:{batch_id}")
}

#[derive(Debug)]
pub struct BatchSystem {
    resources: Arc<SystemResources>,
    waitpoints: Arc<WaitpointSystem>,
}

impl BatchSystem {
    pub fn new(resources: Arc<SystemResources>, waitpoints: Arc<WaitpointSystem>) -> Self {
        Self {
            resources,
            waitpoints,
        }
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> EngineResult<BatchTaskRun> {
        self.resources
            .store
            .find_batch(batch_id)
            .await?
            .ok_or(EngineError::BatchNotFound { batch_id })
    }

    pub async fn list_batch_items(&self, batch_id: Uuid) -> EngineResult<Vec<BatchTaskRunItem>> {
        self.resources.store.list_batch_items(batch_id).await
    }

    #[instrument(skip(self, request), fields(run_count = request.run_count))]
    pub async fn initialize_batch(&self, request: BatchRequest) -> EngineResult<BatchTaskRun> {
        if request.run_count == 0 {
            return Err(EngineError::InvalidInput(
                "A batch needs at least one item".to_string(),
            ));
        }
        let parent_to_block = match (request.parent_run_id, request.resume_parent_on_completion) {
            (Some(parent_id), true) => Some(parent_id),
            (None, true) => {
                return Err(EngineError::InvalidInput(
                    "resume_parent_on_completion requires a parent run".to_string(),
                ))
            }
            _ => None,
        };

        let now = Utc::now();
        let env = &request.environment;
        let id = Uuid::now_v7();
        let waitpoint = parent_to_block
            .map(|_| WaitpointSystem::batch_waitpoint(id, env.id, env.project_id));
        let batch = BatchTaskRun {
            id,
            friendly_id: generate_friendly_id("batch"),
            status: BatchTaskRunStatus::Processing,
            run_count: request.run_count,
            processed_count: 0,
            successful_run_count: 0,
            failed_run_count: 0,
            run_ids: Vec::new(),
            parent_run_id: request.parent_run_id,
            resume_parent_on_completion: request.resume_parent_on_completion,
            waitpoint_id: waitpoint.as_ref().map(|w| w.id),
            runtime_environment_id: env.id,
            project_id: env.project_id,
            organization_id: env.organization_id,
            sealed_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = StoreTransaction::new();
        tx.push(StoreWrite::InsertBatch(batch.clone()));
        if let Some(waitpoint) = &waitpoint {
            tx.push(StoreWrite::InsertWaitpoint(waitpoint.clone()));
        }
        self.resources.commit(tx).await?;

        if let (Some(parent_id), Some(waitpoint)) = (parent_to_block, &waitpoint) {
            self.waitpoints
                .block_run_with_waitpoint(
                    parent_id,
                    &[waitpoint.id],
                    Some(BatchInfo {
                        id: batch.id,
                        index: None,
                    }),
                )
                .await?;
        }

        info!(batch_id = %batch.id, run_count = batch.run_count, "Batch initialized");
        Ok(batch)
    }

    /// Record the outcome of one item. Recording an index twice keeps the
    /// first outcome. The last item seals the batch.
    #[instrument(skip(self, outcome))]
    pub async fn record_batch_item(
        &self,
        batch_id: Uuid,
        index: u32,
        outcome: BatchItemOutcome,
    ) -> EngineResult<BatchTaskRun> {
        let (batch, sealed) = self
            .resources
            .run_lock
            .lock("recordBatchItem", &[batch_resource(batch_id)], None, move || async move {
                let batch = self.get_batch(batch_id).await?;
                if index >= batch.run_count {
                    return Err(EngineError::InvalidInput(format!(
                        "Batch item index {index} is out of range for {} items",
                        batch.run_count
                    )));
                }
                if batch.status.is_sealed() {
                    debug!(batch_id = %batch_id, index, "Batch already sealed, ignoring item");
                    return Ok((batch, false));
                }

                let now = Utc::now();
                let mut tx = StoreTransaction::new();
                tx.push(StoreWrite::RecordBatchItem(BatchTaskRunItem {
                    batch_id,
                    index,
                    outcome,
                    created_at: now,
                }));
                self.resources.commit(tx).await?;

                let mut batch = self.get_batch(batch_id).await?;
                if !batch.all_items_processed() {
                    return Ok((batch, false));
                }

                let status = if batch.failed_run_count > 0 {
                    BatchTaskRunStatus::PartialFailed
                } else {
                    BatchTaskRunStatus::Pending
                };
                let update = BatchUpdate {
                    status: Some(status),
                    sealed_at: Some(now),
                    ..Default::default()
                };
                update.apply_to(&mut batch, now);
                let mut tx = StoreTransaction::new();
                tx.push(StoreWrite::UpdateBatch { batch_id, update });
                self.resources.commit(tx).await?;

                info!(
                    batch_id = %batch_id,
                    successful = batch.successful_run_count,
                    failed = batch.failed_run_count,
                    status = %batch.status,
                    "Batch sealed"
                );
                Ok((batch, true))
            })
            .await?;

        if sealed {
            return Ok(self.try_complete_batch(batch_id).await?.unwrap_or(batch));
        }
        Ok(batch)
    }

    /// Complete a sealed batch whose created runs are all final. Returns
    /// `None` for an unknown batch.
    #[instrument(skip(self))]
    pub async fn try_complete_batch(&self, batch_id: Uuid) -> EngineResult<Option<BatchTaskRun>> {
        let (batch, completed_waitpoint) = self
            .resources
            .run_lock
            .lock("tryCompleteBatch", &[batch_resource(batch_id)], None, move || async move {
                let Some(mut batch) = self.resources.store.find_batch(batch_id).await? else {
                    warn!(batch_id = %batch_id, "Batch to complete does not exist");
                    return Ok((None, None));
                };
                if !batch.status.is_sealed() || batch.status.is_final() {
                    return Ok((Some(batch), None));
                }

                let now = Utc::now();
                let (status, output) = if batch.successful_run_count == 0 {
                    match self.resources.config.batch.zero_success_policy {
                        BatchZeroSuccessPolicy::Abort => (
                            BatchTaskRunStatus::Aborted,
                            WaitpointOutput::error(
                                json!({
                                    "message": "No run in the batch could be created",
                                    "batchId": batch.id,
                                    "failedRunCount": batch.failed_run_count,
                                })
                                .to_string(),
                            ),
                        ),
                        BatchZeroSuccessPolicy::Complete => {
                            (BatchTaskRunStatus::Completed, self.batch_output(&batch))
                        }
                    }
                } else {
                    for run_id in &batch.run_ids {
                        let finished = self
                            .resources
                            .store
                            .find_run(*run_id)
                            .await?
                            .map_or(true, |run| run.is_final());
                        if !finished {
                            debug!(batch_id = %batch_id, run_id = %run_id, "Batch still has running children");
                            return Ok((Some(batch), None));
                        }
                    }
                    (BatchTaskRunStatus::Completed, self.batch_output(&batch))
                };

                let update = BatchUpdate {
                    status: Some(status),
                    completed_at: Some(now),
                    ..Default::default()
                };
                update.apply_to(&mut batch, now);
                let mut tx = StoreTransaction::new();
                tx.push(StoreWrite::UpdateBatch { batch_id, update });
                if let Some(waitpoint_id) = batch.waitpoint_id {
                    tx.push(StoreWrite::CompleteWaitpoint {
                        waitpoint_id,
                        output,
                        completed_at: now,
                    });
                }
                self.resources.commit(tx).await?;

                info!(batch_id = %batch_id, status = %batch.status, "Batch finished");
                let waitpoint_id = batch.waitpoint_id;
                Ok((Some(batch), waitpoint_id))
            })
            .await?;

        if let Some(waitpoint_id) = completed_waitpoint {
            self.waitpoints.resume_blocked_runs(waitpoint_id).await?;
        }
        Ok(batch)
    }

    fn batch_output(&self, batch: &BatchTaskRun) -> WaitpointOutput {
        WaitpointOutput::success(
            Some(
                json!({
                    "id": batch.id,
                    "runs": batch.run_ids,
                    "successfulRunCount": batch.successful_run_count,
                    "failedRunCount": batch.failed_run_count,
                })
                .to_string(),
            ),
            Some(JSON_OUTPUT_TYPE.to_string()),
        )
    }
}
