mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use run_engine::error::EngineError;
use run_engine::events::EngineEvent;
use run_engine::models::{TaskRunExecutionStatus, TaskRunStatus};
use run_engine::worker::EngineJob;

#[tokio::test]
async fn test_delayed_run_is_not_dequeued_until_due() {
    let engine = engine();
    let env = environment();
    let run = engine
        .trigger(request(&env, "later").delayed_until(Utc::now() + ChronoDuration::hours(1)))
        .await
        .unwrap();
    assert_eq!(run.status, TaskRunStatus::Delayed);
    assert_eq!(
        latest(&engine, run.id).await.execution_status,
        TaskRunExecutionStatus::Delayed
    );

    let dequeued = engine
        .dequeue_from_master_queue(WORKER_ID, &run.master_queue, 10)
        .await
        .unwrap();
    assert!(dequeued.is_empty());

    // Not due yet.
    engine.process_due_jobs().await.unwrap();
    assert_eq!(
        engine.get_run(run.id).await.unwrap().status,
        TaskRunStatus::Delayed
    );

    let rescheduled = engine
        .reschedule_delayed_run(run.id, Utc::now() - ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(
        rescheduled.snapshot.execution_status,
        TaskRunExecutionStatus::Delayed
    );

    engine.process_due_jobs().await.unwrap();
    assert_eq!(
        latest(&engine, run.id).await.execution_status,
        TaskRunExecutionStatus::Queued
    );
    let started = start(&engine, &run).await;
    assert_eq!(started.run.status, TaskRunStatus::Executing);
}

#[tokio::test]
async fn test_delay_in_the_past_queues_immediately() {
    let engine = engine();
    let env = environment();
    let run = engine
        .trigger(request(&env, "past").delayed_until(Utc::now() - ChronoDuration::minutes(5)))
        .await
        .unwrap();
    assert_eq!(run.status, TaskRunStatus::Pending);
    dequeue(&engine, &run).await;
}

#[tokio::test]
async fn test_reschedule_requires_delayed_run() {
    let engine = engine();
    let run = trigger(&engine, &environment(), "queued").await;
    let result = engine
        .reschedule_delayed_run(run.id, Utc::now() + ChronoDuration::minutes(1))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidState { .. })));
}

#[tokio::test]
async fn test_debounce_reuses_delayed_run() {
    let engine = engine();
    let env = environment();
    let first_delay = Utc::now() + ChronoDuration::minutes(5);
    let first = engine
        .trigger(
            request(&env, "digest")
                .delayed_until(first_delay)
                .with_debounce_key("user-7"),
        )
        .await
        .unwrap();

    let second_delay = Utc::now() + ChronoDuration::minutes(10);
    let second = engine
        .trigger(
            request(&env, "digest")
                .delayed_until(second_delay)
                .with_debounce_key("user-7"),
        )
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.delay_until, Some(second_delay));

    let other_key = engine
        .trigger(
            request(&env, "digest")
                .delayed_until(second_delay)
                .with_debounce_key("user-8"),
        )
        .await
        .unwrap();
    assert_ne!(other_key.id, first.id);
}

#[tokio::test]
async fn test_debounce_window_elapsed_creates_new_run() {
    let mut config = test_config();
    config.debounce.max_window_ms = 0;
    let engine = engine_with(config);
    let env = environment();
    let delay = Utc::now() + ChronoDuration::minutes(5);

    let first = engine
        .trigger(request(&env, "digest").delayed_until(delay).with_debounce_key("k"))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = engine
        .trigger(request(&env, "digest").delayed_until(delay).with_debounce_key("k"))
        .await
        .unwrap();
    assert_ne!(second.id, first.id);
}

#[tokio::test]
async fn test_ttl_expires_waiting_run() {
    let engine = engine();
    let env = environment();
    let mut events = engine.subscribe();
    let run = engine
        .trigger(request(&env, "short-lived").with_ttl_ms(0))
        .await
        .unwrap();

    engine.process_due_jobs().await.unwrap();

    let expired = engine.get_run(run.id).await.unwrap();
    assert_eq!(expired.status, TaskRunStatus::Expired);
    assert!(expired.expired_at.is_some());
    assert_eq!(
        latest(&engine, run.id).await.execution_status,
        TaskRunExecutionStatus::Finished
    );

    let dequeued = engine
        .dequeue_from_master_queue(WORKER_ID, &run.master_queue, 10)
        .await
        .unwrap();
    assert!(dequeued.is_empty());

    let mut saw_expiry = false;
    while let Ok(published) = events.try_recv() {
        if let EngineEvent::RunExpired { run_id, ttl_ms, .. } = published.event {
            saw_expiry = run_id == run.id && ttl_ms == Some(0);
        }
    }
    assert!(saw_expiry);
}

#[tokio::test]
async fn test_ttl_does_not_expire_started_run() {
    let engine = engine();
    let env = environment();
    let run = engine
        .trigger(request(&env, "quick").with_ttl_ms(0))
        .await
        .unwrap();
    let started = start(&engine, &run).await;

    engine.process_due_jobs().await.unwrap();
    engine.expire_run(run.id).await.unwrap();

    assert_eq!(
        engine.get_run(run.id).await.unwrap().status,
        TaskRunStatus::Executing
    );
    assert_eq!(latest(&engine, run.id).await.id, started.snapshot.id);
}

#[tokio::test]
async fn test_priority_moves_run_ahead() {
    let engine = engine();
    let env = environment();
    let normal = trigger(&engine, &env, "ordered").await;
    let urgent = engine
        .trigger(request(&env, "ordered").with_priority_ms(60_000))
        .await
        .unwrap();

    let first = engine
        .dequeue_from_master_queue(WORKER_ID, &normal.master_queue, 1)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].run.id, urgent.id);
}

#[tokio::test]
async fn test_heartbeat_requires_current_snapshot() {
    let engine = engine();
    let run = trigger(&engine, &environment(), "beating").await;
    let queued = latest(&engine, run.id).await;

    let result = engine.heartbeat_run(run.id, queued.id).await;
    assert!(matches!(result, Err(EngineError::InvalidState { .. })));

    let message = dequeue(&engine, &run).await;
    let stale = engine.heartbeat_run(run.id, queued.id).await;
    assert!(matches!(stale, Err(EngineError::SnapshotConflict { .. })));

    let current = engine
        .heartbeat_run(run.id, message.snapshot.id)
        .await
        .unwrap();
    assert_eq!(current.id, message.snapshot.id);
}

#[tokio::test]
async fn test_unstarted_run_is_requeued_after_heartbeat_timeout() {
    let mut config = test_config();
    config.heartbeat.pending_executing_ms = 0;
    let engine = engine_with(config);
    let env = environment();
    let run = trigger(&engine, &env, "abandoned").await;
    dequeue(&engine, &run).await;

    engine.process_due_jobs().await.unwrap();

    assert_eq!(
        latest(&engine, run.id).await.execution_status,
        TaskRunExecutionStatus::Queued
    );
    assert_eq!(
        engine
            .run_queue()
            .current_concurrency_of_environment(&env)
            .await
            .unwrap(),
        0
    );
    let again = dequeue(&engine, &run).await;
    assert_eq!(
        again.snapshot.execution_status,
        TaskRunExecutionStatus::PendingExecuting
    );
}

#[tokio::test]
async fn test_stalled_run_is_retried_after_heartbeat_timeout() {
    let mut config = test_config();
    config.heartbeat.executing_ms = 0;
    let engine = engine_with(config);
    let started = trigger_and_start(&engine, &environment(), "stalled").await;

    engine.process_due_jobs().await.unwrap();

    let run = engine.get_run(started.run.id).await.unwrap();
    assert_eq!(run.status, TaskRunStatus::RetryingAfterFailure);
    assert_eq!(
        latest(&engine, run.id).await.execution_status,
        TaskRunExecutionStatus::Queued
    );
}

#[tokio::test]
async fn test_heartbeat_pushes_back_deadline() {
    let engine = engine();
    let started = trigger_and_start(&engine, &environment(), "alive").await;
    let job_id = EngineJob::HeartbeatSnapshot {
        run_id: started.run.id,
        snapshot_id: started.snapshot.id,
    }
    .id();

    let due_at = |pending: Vec<(String, i64)>| {
        pending
            .into_iter()
            .find(|(id, _)| *id == job_id)
            .map(|(_, due)| due)
            .unwrap()
    };
    let before = due_at(engine.jobs().pending().await.unwrap());

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    engine
        .heartbeat_run(started.run.id, started.snapshot.id)
        .await
        .unwrap();
    let after = due_at(engine.jobs().pending().await.unwrap());
    assert!(after > before);

    let stored = engine.jobs().find(&job_id).await.unwrap().unwrap();
    assert_eq!(
        stored.job,
        EngineJob::HeartbeatSnapshot {
            run_id: started.run.id,
            snapshot_id: started.snapshot.id,
        }
    );
}
