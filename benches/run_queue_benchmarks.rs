use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use run_engine::config::{EngineConfig, RunQueueConfig};
use run_engine::engine::{RunEngine, TriggerRequest};
use run_engine::models::{AuthenticatedEnvironment, RuntimeEnvironmentType};
use run_engine::run_queue::{OldestFirstStrategy, QueueBackend, QueueMessage, RunQueue};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

const MASTER: &str = "main";

fn message(env: &AuthenticatedEnvironment, queue: &str) -> QueueMessage {
    QueueMessage {
        run_id: Uuid::now_v7(),
        task_identifier: "bench-task".to_string(),
        organization_id: env.organization_id,
        project_id: env.project_id,
        environment_id: env.id,
        environment_type: env.env_type,
        queue: queue.to_string(),
        concurrency_key: None,
        timestamp: Utc::now().timestamp_millis() - 1_000,
        attempt: 0,
        master_queue: MASTER.to_string(),
    }
}

fn queue() -> RunQueue {
    let config = RunQueueConfig {
        default_env_concurrency: 10_000,
        ..RunQueueConfig::default()
    };
    RunQueue::new(config, QueueBackend::memory(), Arc::new(OldestFirstStrategy))
}

fn benchmark_enqueue_dequeue_ack(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);

    let mut group = c.benchmark_group("run_queue_cycle");
    for queues in [1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(queues), &queues, |b, &queues| {
            let rq = queue();
            let names: Vec<String> = (0..queues).map(|i| format!("task/bench-{i}")).collect();
            b.to_async(&runtime).iter(|| async {
                for name in &names {
                    rq.enqueue_message(&env, message(&env, name), MASTER)
                        .await
                        .unwrap();
                }
                let dequeued = rq
                    .dequeue_message_in_shared_queue("bench", MASTER, queues)
                    .await
                    .unwrap();
                for item in &dequeued {
                    rq.acknowledge_message(env.organization_id, item.message.run_id)
                        .await
                        .unwrap();
                }
                black_box(dequeued.len())
            });
        });
    }
    group.finish();
}

fn benchmark_trigger_and_dequeue(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut config = EngineConfig::default();
    config.worker.enabled = false;
    config.queue.default_env_concurrency = 1_000_000;
    let engine = RunEngine::in_memory(config);
    let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);

    c.bench_function("engine_trigger_and_dequeue", |b| {
        b.to_async(&runtime).iter(|| async {
            let run = engine
                .trigger(TriggerRequest::new(env.clone(), "bench-task", json!({"n": 1})))
                .await
                .unwrap();
            let dequeued = engine
                .dequeue_from_master_queue("bench", &run.master_queue, 1)
                .await
                .unwrap();
            black_box(dequeued)
        });
    });
}

criterion_group!(benches, benchmark_enqueue_dequeue_ack, benchmark_trigger_and_dequeue);
criterion_main!(benches);
