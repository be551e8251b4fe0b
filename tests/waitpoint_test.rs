mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use futures::future::join_all;
use run_engine::error::EngineError;
use run_engine::models::{
    TaskRunExecutionResult, TaskRunExecutionStatus, TaskRunStatus, WaitpointOutput,
    WaitpointStatus, WaitpointType,
};

#[tokio::test]
async fn test_manual_waitpoint_blocks_and_resumes() {
    let engine = engine();
    let env = environment();
    let started = trigger_and_start(&engine, &env, "approval").await;
    let run_id = started.run.id;

    let waitpoint = engine.create_manual_waitpoint(&env, None).await.unwrap();
    assert_eq!(waitpoint.kind, WaitpointType::Manual);
    assert_eq!(waitpoint.status, WaitpointStatus::Pending);

    let blocked = engine
        .block_run_with_waitpoint(run_id, &[waitpoint.id], None)
        .await
        .unwrap();
    assert_eq!(
        blocked.execution_status,
        TaskRunExecutionStatus::ExecutingWithWaitpoints
    );
    assert_eq!(
        engine.get_run(run_id).await.unwrap().status,
        TaskRunStatus::ExecutingWithWaitpoints
    );

    // Still blocked, nothing to continue.
    assert!(engine
        .continue_run_if_unblocked(run_id)
        .await
        .unwrap()
        .is_none());

    let completed = engine
        .complete_waitpoint(
            waitpoint.id,
            WaitpointOutput::success(Some("{\"approved\":true}".to_string()), None),
        )
        .await
        .unwrap();
    assert_eq!(completed.status, WaitpointStatus::Completed);

    let resumed = latest(&engine, run_id).await;
    assert_eq!(resumed.execution_status, TaskRunExecutionStatus::Executing);
    assert_eq!(resumed.completed_waitpoints.len(), 1);

    let data = engine.get_run_execution_data(run_id).await.unwrap();
    assert_eq!(data.run_status, TaskRunStatus::Executing);
    assert_eq!(data.completed_waitpoints.len(), 1);
    assert_eq!(data.completed_waitpoints[0].id, waitpoint.id);
    assert_eq!(
        data.completed_waitpoints[0].output.as_deref(),
        Some("{\"approved\":true}")
    );
    assert!(!data.completed_waitpoints[0].output_is_error);

    // The resumed run can finish normally.
    let done = engine
        .complete_run_attempt(
            run_id,
            resumed.id,
            TaskRunExecutionResult::success(None),
            worker(),
        )
        .await
        .unwrap();
    assert_eq!(done.run.status, TaskRunStatus::CompletedSuccessfully);
}

#[tokio::test]
async fn test_completing_twice_keeps_first_output() {
    let engine = engine();
    let env = environment();
    let waitpoint = engine.create_manual_waitpoint(&env, None).await.unwrap();

    engine
        .complete_waitpoint(waitpoint.id, WaitpointOutput::success(Some("1".into()), None))
        .await
        .unwrap();
    let second = engine
        .complete_waitpoint(waitpoint.id, WaitpointOutput::success(Some("2".into()), None))
        .await
        .unwrap();
    assert_eq!(second.output.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_blocking_on_completed_waitpoint_continues_immediately() {
    let engine = engine();
    let env = environment();
    let started = trigger_and_start(&engine, &env, "instant").await;

    let waitpoint = engine.create_manual_waitpoint(&env, None).await.unwrap();
    engine
        .complete_waitpoint(waitpoint.id, WaitpointOutput::default())
        .await
        .unwrap();

    let snapshot = engine
        .block_run_with_waitpoint(started.run.id, &[waitpoint.id], None)
        .await
        .unwrap();
    assert_eq!(snapshot.execution_status, TaskRunExecutionStatus::Executing);
    assert_eq!(snapshot.completed_waitpoints.len(), 1);

    let chain = snapshot_chain(&engine, started.run.id).await;
    assert_eq!(
        statuses(&chain[chain.len() - 2..]),
        vec![
            TaskRunExecutionStatus::ExecutingWithWaitpoints,
            TaskRunExecutionStatus::Executing,
        ]
    );
}

#[tokio::test]
async fn test_block_requires_executing_run() {
    let engine = engine();
    let env = environment();
    let run = trigger(&engine, &env, "queued").await;
    let waitpoint = engine.create_manual_waitpoint(&env, None).await.unwrap();

    let result = engine
        .block_run_with_waitpoint(run.id, &[waitpoint.id], None)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidState { .. })));

    let started = start(&engine, &run).await;
    let empty = engine
        .block_run_with_waitpoint(started.run.id, &[], None)
        .await;
    assert!(matches!(empty, Err(EngineError::InvalidInput(_))));

    let missing = engine
        .block_run_with_waitpoint(started.run.id, &[uuid::Uuid::now_v7()], None)
        .await;
    assert!(matches!(missing, Err(EngineError::WaitpointNotFound { .. })));
}

#[tokio::test]
async fn test_run_waits_for_every_blocker() {
    let engine = engine();
    let env = environment();
    let started = trigger_and_start(&engine, &env, "fan-in").await;
    let first = engine.create_manual_waitpoint(&env, None).await.unwrap();
    let second = engine.create_manual_waitpoint(&env, None).await.unwrap();

    engine
        .block_run_with_waitpoint(started.run.id, &[first.id, second.id], None)
        .await
        .unwrap();

    engine
        .complete_waitpoint(first.id, WaitpointOutput::default())
        .await
        .unwrap();
    assert_eq!(
        latest(&engine, started.run.id).await.execution_status,
        TaskRunExecutionStatus::ExecutingWithWaitpoints
    );

    engine
        .complete_waitpoint(second.id, WaitpointOutput::default())
        .await
        .unwrap();
    let resumed = latest(&engine, started.run.id).await;
    assert_eq!(resumed.execution_status, TaskRunExecutionStatus::Executing);
    assert_eq!(resumed.completed_waitpoints.len(), 2);
}

#[tokio::test]
async fn test_manual_waitpoint_idempotency_key() {
    let engine = engine();
    let env = environment();
    let first = engine
        .create_manual_waitpoint(&env, Some("approval-42".to_string()))
        .await
        .unwrap();
    let second = engine
        .create_manual_waitpoint(&env, Some("approval-42".to_string()))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert!(first.user_provided_idempotency_key);

    let other = engine.create_manual_waitpoint(&env, None).await.unwrap();
    assert_ne!(other.id, first.id);
}

#[tokio::test]
async fn test_date_time_waitpoint_completes_when_due() {
    let engine = engine();
    let env = environment();
    let started = trigger_and_start(&engine, &env, "sleeper").await;

    let waitpoint = engine
        .create_date_time_waitpoint(&env, Utc::now() - ChronoDuration::seconds(1), None)
        .await
        .unwrap();
    assert_eq!(waitpoint.kind, WaitpointType::Datetime);
    engine
        .block_run_with_waitpoint(started.run.id, &[waitpoint.id], None)
        .await
        .unwrap();

    let processed = engine.process_due_jobs().await.unwrap();
    assert!(processed.succeeded >= 1);

    assert_eq!(
        latest(&engine, started.run.id).await.execution_status,
        TaskRunExecutionStatus::Executing
    );
}

#[tokio::test]
async fn test_future_date_time_waitpoint_stays_pending() {
    let engine = engine();
    let env = environment();
    let waitpoint = engine
        .create_date_time_waitpoint(&env, Utc::now() + ChronoDuration::hours(1), None)
        .await
        .unwrap();

    engine.process_due_jobs().await.unwrap();
    let stored = engine
        .store()
        .find_waitpoint(waitpoint.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, WaitpointStatus::Pending);
    assert!(waitpoint.completed_after.is_some());
}

#[tokio::test]
async fn test_parent_resumes_when_child_finishes() {
    let engine = engine();
    let env = environment();
    let parent = trigger_and_start(&engine, &env, "parent").await;

    let child = engine
        .trigger(request(&env, "child").with_parent(parent.run.id, true))
        .await
        .unwrap();
    assert!(child.associated_waitpoint_id.is_some());
    assert_eq!(
        latest(&engine, parent.run.id).await.execution_status,
        TaskRunExecutionStatus::ExecutingWithWaitpoints
    );

    let child_started = start(&engine, &child).await;
    engine
        .complete_run_attempt(
            child.id,
            child_started.snapshot.id,
            TaskRunExecutionResult::success(Some("{\"ok\":1}".to_string())),
            worker(),
        )
        .await
        .unwrap();

    let data = engine.get_run_execution_data(parent.run.id).await.unwrap();
    assert_eq!(data.snapshot.execution_status, TaskRunExecutionStatus::Executing);
    assert_eq!(data.completed_waitpoints.len(), 1);
    let completed = &data.completed_waitpoints[0];
    assert_eq!(completed.kind, WaitpointType::Run);
    assert_eq!(completed.completed_by_task_run_id, Some(child.id));
    assert_eq!(completed.output.as_deref(), Some("{\"ok\":1}"));
    assert!(!completed.output_is_error);
}

#[tokio::test]
async fn test_waitpoint_of_finished_run_is_already_complete() {
    let engine = engine();
    let started = trigger_and_start(&engine, &environment(), "done").await;
    engine
        .complete_run_attempt(
            started.run.id,
            started.snapshot.id,
            TaskRunExecutionResult::success(Some("42".to_string())),
            worker(),
        )
        .await
        .unwrap();

    let waitpoint = engine
        .get_or_create_run_waitpoint(started.run.id)
        .await
        .unwrap();
    assert_eq!(waitpoint.status, WaitpointStatus::Completed);
    assert_eq!(waitpoint.output.as_deref(), Some("42"));
}

#[tokio::test]
async fn test_concurrent_run_waitpoint_requests_share_one_waitpoint() {
    let engine = engine();
    let run = trigger(&engine, &environment(), "shared").await;

    let requests = (0..8).map(|_| engine.get_or_create_run_waitpoint(run.id));
    let waitpoints: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    let first = waitpoints[0].id;
    assert!(waitpoints.iter().all(|w| w.id == first));
    assert_eq!(
        engine.get_run(run.id).await.unwrap().associated_waitpoint_id,
        Some(first)
    );
}

#[tokio::test]
async fn test_blocked_run_releases_environment_concurrency() {
    let engine = engine();
    let env = environment();
    let started = trigger_and_start(&engine, &env, "suspend").await;
    let run_queue = engine.run_queue();
    assert_eq!(
        run_queue.current_concurrency_of_environment(&env).await.unwrap(),
        1
    );

    let waitpoint = engine.create_manual_waitpoint(&env, None).await.unwrap();
    engine
        .block_run_with_waitpoint(started.run.id, &[waitpoint.id], None)
        .await
        .unwrap();
    assert_eq!(
        run_queue.current_concurrency_of_environment(&env).await.unwrap(),
        0
    );
    // Queue slot is held by default.
    assert_eq!(
        run_queue
            .current_concurrency_of_queue(&env, &started.run.queue, None)
            .await
            .unwrap(),
        1
    );

    engine
        .complete_waitpoint(waitpoint.id, WaitpointOutput::default())
        .await
        .unwrap();
    assert_eq!(
        run_queue.current_concurrency_of_environment(&env).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_waiting_child_of_queued_parent_is_not_created() {
    let engine = engine();
    let env = environment();
    let parent = trigger(&engine, &env, "parent").await;

    let result = engine
        .trigger(request(&env, "child").with_parent(parent.id, true))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidState { .. })));

    // Only the parent is in the queue; no orphaned child was enqueued.
    let dequeued = engine
        .dequeue_from_master_queue(WORKER_ID, &parent.master_queue, 50)
        .await
        .unwrap();
    assert_eq!(dequeued.len(), 1);
    assert_eq!(dequeued[0].run.id, parent.id);
    assert_eq!(
        latest(&engine, parent.id).await.execution_status,
        TaskRunExecutionStatus::PendingExecuting
    );
}
