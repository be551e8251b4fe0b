#![allow(dead_code)]

pub mod strategies;

use run_engine::config::EngineConfig;
use run_engine::engine::{RunEngine, TriggerRequest};
use run_engine::locking::RunLocker;
use run_engine::models::{
    AuthenticatedEnvironment, DequeuedMessage, ExecutionSnapshot, RuntimeEnvironmentType,
    StartRunAttemptResult, TaskRun, TaskRunExecutionResult, TaskRunExecutionStatus,
    WorkerIdentity,
};
use run_engine::run_queue::{OldestFirstStrategy, QueueBackend, RunQueue};
use run_engine::store::MemoryEngineStore;
use serde_json::json;
use std::sync::Arc;

pub const WORKER_ID: &str = "test-worker";

/// Defaults with the background job loop off; tests drive jobs through
/// `process_due_jobs`.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.enabled = false;
    config
}

pub fn engine() -> Arc<RunEngine> {
    engine_with(test_config())
}

/// In-memory engine with deterministic queue selection.
pub fn engine_with(config: EngineConfig) -> Arc<RunEngine> {
    run_engine::logging::init_structured_logging();
    let run_queue = RunQueue::new(
        config.queue.clone(),
        QueueBackend::memory(),
        Arc::new(OldestFirstStrategy),
    );
    let run_lock = RunLocker::in_memory(run_queue.keys().clone(), &config.run_lock);
    RunEngine::new(config, Arc::new(MemoryEngineStore::new()), run_queue, run_lock)
}

pub fn environment() -> AuthenticatedEnvironment {
    AuthenticatedEnvironment::new(RuntimeEnvironmentType::Development)
}

pub fn worker() -> WorkerIdentity {
    WorkerIdentity {
        worker_id: Some(WORKER_ID.to_string()),
        runner_id: Some("runner-1".to_string()),
    }
}

pub fn request(env: &AuthenticatedEnvironment, task: &str) -> TriggerRequest {
    TriggerRequest::new(env.clone(), task, json!({"task": task}))
}

pub async fn trigger(engine: &RunEngine, env: &AuthenticatedEnvironment, task: &str) -> TaskRun {
    engine.trigger(request(env, task)).await.unwrap()
}

/// Dequeue everything due on the run's master queue and return the message
/// for `run`.
pub async fn dequeue(engine: &RunEngine, run: &TaskRun) -> DequeuedMessage {
    let mut dequeued = engine
        .dequeue_from_master_queue(WORKER_ID, &run.master_queue, 50)
        .await
        .unwrap();
    let index = dequeued
        .iter()
        .position(|message| message.run.id == run.id)
        .unwrap_or_else(|| panic!("run {} was not dequeued", run.id));
    dequeued.swap_remove(index)
}

/// Dequeue several runs at once and start an attempt for each, in the order
/// of `runs`.
pub async fn start_all(engine: &RunEngine, runs: &[TaskRun]) -> Vec<StartRunAttemptResult> {
    let dequeued = engine
        .dequeue_from_master_queue(WORKER_ID, &runs[0].master_queue, 50)
        .await
        .unwrap();
    let mut started = Vec::with_capacity(runs.len());
    for run in runs {
        let message = dequeued
            .iter()
            .find(|message| message.run.id == run.id)
            .unwrap_or_else(|| panic!("run {} was not dequeued", run.id));
        started.push(
            engine
                .start_run_attempt(run.id, message.snapshot.id, worker(), false)
                .await
                .unwrap(),
        );
    }
    started
}

/// Report success for a started attempt.
pub async fn succeed(engine: &RunEngine, started: &StartRunAttemptResult, output: Option<&str>) {
    engine
        .complete_run_attempt(
            started.run.id,
            started.snapshot.id,
            TaskRunExecutionResult::success(output.map(str::to_string)),
            worker(),
        )
        .await
        .unwrap();
}

/// Dequeue and start the first attempt of `run`.
pub async fn start(engine: &RunEngine, run: &TaskRun) -> StartRunAttemptResult {
    let message = dequeue(engine, run).await;
    assert_eq!(
        message.snapshot.execution_status,
        TaskRunExecutionStatus::PendingExecuting
    );
    engine
        .start_run_attempt(run.id, message.snapshot.id, worker(), false)
        .await
        .unwrap()
}

pub async fn trigger_and_start(
    engine: &RunEngine,
    env: &AuthenticatedEnvironment,
    task: &str,
) -> StartRunAttemptResult {
    let run = trigger(engine, env, task).await;
    start(engine, &run).await
}

pub async fn latest(engine: &RunEngine, run_id: uuid::Uuid) -> ExecutionSnapshot {
    engine.get_latest_execution_snapshot(run_id).await.unwrap()
}

/// Every snapshot of a run, oldest first.
pub async fn snapshot_chain(engine: &RunEngine, run_id: uuid::Uuid) -> Vec<ExecutionSnapshot> {
    engine.store().list_snapshots(run_id).await.unwrap()
}

pub fn statuses(chain: &[ExecutionSnapshot]) -> Vec<TaskRunExecutionStatus> {
    chain.iter().map(|s| s.execution_status).collect()
}
