mod common;

use async_trait::async_trait;
use common::*;
use run_engine::config::BatchZeroSuccessPolicy;
use run_engine::engine::{
    BatchItemError, BatchItemProcessor, BatchRequest, RunEngine, TriggerBatchItems,
};
use run_engine::error::EngineError;
use run_engine::models::{
    AuthenticatedEnvironment, BatchTaskRun, BatchTaskRunStatus, TaskRun,
    TaskRunExecutionStatus, WaitpointType,
};
use serde_json::json;
use uuid::Uuid;

/// Processor whose items never produce a run.
struct Rejecting;

#[async_trait]
impl BatchItemProcessor for Rejecting {
    async fn process_item(
        &self,
        _engine: &RunEngine,
        _batch: &BatchTaskRun,
        index: u32,
    ) -> Result<Uuid, BatchItemError> {
        Err(BatchItemError::new(format!("payload {index} is too large")))
    }
}

fn items(env: &AuthenticatedEnvironment, count: usize) -> TriggerBatchItems {
    TriggerBatchItems {
        template: request(env, "batch-child"),
        payloads: (0..count).map(|i| json!({"item": i})).collect(),
    }
}

async fn children(engine: &RunEngine, batch: &BatchTaskRun) -> Vec<TaskRun> {
    let mut runs = Vec::new();
    for run_id in &batch.run_ids {
        runs.push(engine.get_run(*run_id).await.unwrap());
    }
    runs
}

#[tokio::test]
async fn test_batch_with_failed_item_resumes_parent() {
    let engine = engine();
    let env = environment();
    let parent = trigger_and_start(&engine, &env, "fan-out").await;

    let batch = engine
        .initialize_batch(BatchRequest {
            environment: env.clone(),
            run_count: 3,
            parent_run_id: Some(parent.run.id),
            resume_parent_on_completion: true,
        })
        .await
        .unwrap();
    assert_eq!(batch.status, BatchTaskRunStatus::Processing);
    assert!(batch.waitpoint_id.is_some());
    assert_eq!(
        latest(&engine, parent.run.id).await.execution_status,
        TaskRunExecutionStatus::ExecutingWithWaitpoints
    );

    let processor = items(&env, 3);
    engine
        .enqueue_batch_item(batch.id, 0, &processor)
        .await
        .unwrap();
    engine
        .enqueue_batch_item(batch.id, 1, &Rejecting)
        .await
        .unwrap();
    let sealed = engine
        .enqueue_batch_item(batch.id, 2, &processor)
        .await
        .unwrap();
    assert_eq!(sealed.status, BatchTaskRunStatus::PartialFailed);
    assert_eq!(sealed.successful_run_count, 2);
    assert_eq!(sealed.failed_run_count, 1);
    assert!(sealed.sealed_at.is_some());

    let runs = children(&engine, &sealed).await;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|run| run.batch_id == Some(batch.id)));
    assert!(runs.iter().all(|run| run.parent_task_run_id == Some(parent.run.id)));

    let started = start_all(&engine, &runs).await;
    succeed(&engine, &started[0], Some("1")).await;

    // One child still running.
    engine.process_due_jobs().await.unwrap();
    assert_eq!(
        engine.get_batch(batch.id).await.unwrap().status,
        BatchTaskRunStatus::PartialFailed
    );
    assert_eq!(
        latest(&engine, parent.run.id).await.execution_status,
        TaskRunExecutionStatus::ExecutingWithWaitpoints
    );

    succeed(&engine, &started[1], Some("2")).await;
    engine.process_due_jobs().await.unwrap();

    let completed = engine.get_batch(batch.id).await.unwrap();
    assert_eq!(completed.status, BatchTaskRunStatus::Completed);
    assert!(completed.completed_at.is_some());

    let data = engine.get_run_execution_data(parent.run.id).await.unwrap();
    assert_eq!(data.snapshot.execution_status, TaskRunExecutionStatus::Executing);
    assert_eq!(data.completed_waitpoints.len(), 3);

    let batch_waitpoint = data
        .completed_waitpoints
        .iter()
        .find(|w| w.kind == WaitpointType::Batch)
        .unwrap();
    assert_eq!(batch_waitpoint.index, None);
    assert_eq!(batch_waitpoint.completed_by_batch_id, Some(batch.id));

    let mut indexes: Vec<_> = data
        .completed_waitpoints
        .iter()
        .filter(|w| w.kind == WaitpointType::Run)
        .map(|w| w.index)
        .collect();
    indexes.sort();
    assert_eq!(indexes, vec![Some(0), Some(2)]);
}

#[tokio::test]
async fn test_zero_success_batch_aborts_by_default() {
    let engine = engine();
    let env = environment();
    let parent = trigger_and_start(&engine, &env, "all-bad").await;

    let batch = engine
        .initialize_batch(BatchRequest {
            environment: env.clone(),
            run_count: 2,
            parent_run_id: Some(parent.run.id),
            resume_parent_on_completion: true,
        })
        .await
        .unwrap();
    engine
        .enqueue_batch_item(batch.id, 0, &Rejecting)
        .await
        .unwrap();
    let finished = engine
        .enqueue_batch_item(batch.id, 1, &Rejecting)
        .await
        .unwrap();

    assert_eq!(finished.status, BatchTaskRunStatus::Aborted);
    assert_eq!(finished.failed_run_count, 2);

    let data = engine.get_run_execution_data(parent.run.id).await.unwrap();
    assert_eq!(data.snapshot.execution_status, TaskRunExecutionStatus::Executing);
    assert_eq!(data.completed_waitpoints.len(), 1);
    assert!(data.completed_waitpoints[0].output_is_error);
}

#[tokio::test]
async fn test_zero_success_batch_can_complete() {
    let mut config = test_config();
    config.batch.zero_success_policy = BatchZeroSuccessPolicy::Complete;
    let engine = engine_with(config);
    let env = environment();

    let batch = engine
        .initialize_batch(BatchRequest {
            environment: env.clone(),
            run_count: 1,
            parent_run_id: None,
            resume_parent_on_completion: false,
        })
        .await
        .unwrap();
    let finished = engine
        .enqueue_batch_item(batch.id, 0, &Rejecting)
        .await
        .unwrap();
    assert_eq!(finished.status, BatchTaskRunStatus::Completed);
}

#[tokio::test]
async fn test_batch_without_parent_completes_after_children() {
    let engine = engine();
    let env = environment();
    let batch = engine
        .initialize_batch(BatchRequest {
            environment: env.clone(),
            run_count: 2,
            parent_run_id: None,
            resume_parent_on_completion: false,
        })
        .await
        .unwrap();
    assert!(batch.waitpoint_id.is_none());

    let processor = items(&env, 2);
    engine
        .enqueue_batch_item(batch.id, 0, &processor)
        .await
        .unwrap();
    let sealed = engine
        .enqueue_batch_item(batch.id, 1, &processor)
        .await
        .unwrap();
    assert_eq!(sealed.status, BatchTaskRunStatus::Pending);

    let runs = children(&engine, &sealed).await;
    for started in start_all(&engine, &runs).await {
        succeed(&engine, &started, None).await;
    }
    engine.process_due_jobs().await.unwrap();

    assert_eq!(
        engine.get_batch(batch.id).await.unwrap().status,
        BatchTaskRunStatus::Completed
    );
}

#[tokio::test]
async fn test_batch_validation() {
    let engine = engine();
    let env = environment();

    let empty = engine
        .initialize_batch(BatchRequest {
            environment: env.clone(),
            run_count: 0,
            parent_run_id: None,
            resume_parent_on_completion: false,
        })
        .await;
    assert!(matches!(empty, Err(EngineError::InvalidInput(_))));

    let orphan = engine
        .initialize_batch(BatchRequest {
            environment: env.clone(),
            run_count: 1,
            parent_run_id: None,
            resume_parent_on_completion: true,
        })
        .await;
    assert!(matches!(orphan, Err(EngineError::InvalidInput(_))));

    let batch = engine
        .initialize_batch(BatchRequest {
            environment: env.clone(),
            run_count: 1,
            parent_run_id: None,
            resume_parent_on_completion: false,
        })
        .await
        .unwrap();
    let out_of_range = engine.enqueue_batch_item(batch.id, 5, &Rejecting).await;
    assert!(matches!(out_of_range, Err(EngineError::InvalidInput(_))));

    let unknown = engine.get_batch(Uuid::now_v7()).await;
    assert!(matches!(unknown, Err(EngineError::BatchNotFound { .. })));
}
