//! Redis queue backend.
//!
//! Uses `redis::aio::ConnectionManager` for multiplexed connections with
//! automatic reconnection, and runs every multi-key operation as a Lua
//! script so it executes atomically on the server.
//! Requires the `redis-queue` feature flag.

use crate::error::{EngineError, EngineResult};
use crate::logging::redact_url;
use crate::run_queue::scripts::{
    self, AcknowledgeArgs, ConcurrencyKeys, DeadLetterArgs, DequeueArgs, DequeueKeys,
    DequeueOutcome, EnqueueArgs, EnqueueKeys, MessageKeys, NackArgs, ReleaseConcurrencyArgs,
};
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct QueueScripts {
    enqueue: Script,
    dequeue: Script,
    acknowledge: Script,
    nack: Script,
    dead_letter: Script,
    release_concurrency: Script,
    reacquire_concurrency: Script,
    claim_due_jobs: Script,
    settle_job: Script,
}

impl QueueScripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(&scripts::render(scripts::ENQUEUE_MESSAGE)),
            dequeue: Script::new(&scripts::render(scripts::DEQUEUE_MESSAGE)),
            acknowledge: Script::new(&scripts::render(scripts::ACKNOWLEDGE_MESSAGE)),
            nack: Script::new(&scripts::render(scripts::NACK_MESSAGE)),
            dead_letter: Script::new(&scripts::render(scripts::MOVE_TO_DEAD_LETTER)),
            release_concurrency: Script::new(scripts::RELEASE_CONCURRENCY),
            reacquire_concurrency: Script::new(scripts::REACQUIRE_CONCURRENCY),
            claim_due_jobs: Script::new(scripts::CLAIM_DUE_JOBS),
            settle_job: Script::new(scripts::SETTLE_JOB),
        }
    }
}

/// Redis-backed run queue storage
#[derive(Clone)]
pub struct RedisQueueStore {
    connection_manager: ConnectionManager,
    scripts: Arc<QueueScripts>,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisQueueStore {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EngineError::Queue(format!("Failed to create Redis client: {e}")))?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::Queue(format!("Failed to connect to Redis: {e}")))?;

        debug!(url = %redact_url(url), "Redis queue store connected");
        Ok(Self {
            connection_manager,
            scripts: Arc::new(QueueScripts::load()),
        })
    }

    pub async fn enqueue(&self, keys: &EnqueueKeys, args: &EnqueueArgs) -> EngineResult<()> {
        let mut conn = self.connection_manager.clone();
        let mut invocation = self.scripts.enqueue.prepare_invoke();
        for key in keys.to_vec() {
            invocation.key(key);
        }
        invocation
            .arg(&args.queue_name)
            .arg(&args.run_id)
            .arg(&args.message_data)
            .arg(args.score)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn peek_due(&self, queue_key: &str, now_ms: i64) -> EngineResult<Option<String>> {
        let mut conn = self.connection_manager.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(queue_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(due.into_iter().next())
    }

    pub async fn dequeue(
        &self,
        keys: &DequeueKeys,
        args: &DequeueArgs,
    ) -> EngineResult<DequeueOutcome> {
        let mut conn = self.connection_manager.clone();
        let mut invocation = self.scripts.dequeue.prepare_invoke();
        for key in keys.to_vec() {
            invocation.key(key);
        }
        let (status, run_id, payload): (i64, String, String) = invocation
            .arg(&args.queue_name)
            .arg(args.now_ms)
            .arg(args.default_env_concurrency)
            .arg(&args.run_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(DequeueOutcome::from_reply(status, run_id, payload))
    }

    pub async fn acknowledge(&self, keys: &MessageKeys, args: &AcknowledgeArgs) -> EngineResult<()> {
        let mut conn = self.connection_manager.clone();
        let mut invocation = self.scripts.acknowledge.prepare_invoke();
        for key in keys.to_vec() {
            invocation.key(key);
        }
        invocation
            .arg(&args.queue_name)
            .arg(&args.run_id)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn nack(&self, keys: &MessageKeys, args: &NackArgs) -> EngineResult<bool> {
        let mut conn = self.connection_manager.clone();
        let mut invocation = self.scripts.nack.prepare_invoke();
        for key in keys.to_vec() {
            invocation.key(key);
        }
        let requeued: i64 = invocation
            .arg(&args.queue_name)
            .arg(&args.run_id)
            .arg(&args.message_data)
            .arg(args.score)
            .invoke_async(&mut conn)
            .await?;
        Ok(requeued == 1)
    }

    pub async fn move_to_dead_letter(
        &self,
        keys: &MessageKeys,
        dead_letter_key: &str,
        args: &DeadLetterArgs,
    ) -> EngineResult<bool> {
        let mut conn = self.connection_manager.clone();
        let mut invocation = self.scripts.dead_letter.prepare_invoke();
        for key in keys.to_vec() {
            invocation.key(key);
        }
        let moved: i64 = invocation
            .key(dead_letter_key)
            .arg(&args.queue_name)
            .arg(&args.run_id)
            .arg(args.now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    pub async fn release_concurrency(
        &self,
        keys: &ConcurrencyKeys,
        args: &ReleaseConcurrencyArgs,
    ) -> EngineResult<()> {
        let mut conn = self.connection_manager.clone();
        let mut invocation = self.scripts.release_concurrency.prepare_invoke();
        for key in keys.to_vec() {
            invocation.key(key);
        }
        invocation
            .arg(&args.run_id)
            .arg(if args.release_queue { "1" } else { "0" })
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn reacquire_concurrency(&self, keys: &ConcurrencyKeys, run_id: &str) -> EngineResult<()> {
        let mut conn = self.connection_manager.clone();
        let mut invocation = self.scripts.reacquire_concurrency.prepare_invoke();
        for key in keys.to_vec() {
            invocation.key(key);
        }
        invocation
            .arg(run_id)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut conn = self.connection_manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> EngineResult<()> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    pub async fn zcard(&self, key: &str) -> EngineResult<u64> {
        let mut conn = self.connection_manager.clone();
        Ok(redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?)
    }

    pub async fn scard(&self, key: &str) -> EngineResult<u64> {
        let mut conn = self.connection_manager.clone();
        Ok(redis::cmd("SCARD").arg(key).query_async(&mut conn).await?)
    }

    pub async fn smembers(&self, key: &str) -> EngineResult<Vec<String>> {
        let mut conn = self.connection_manager.clone();
        let mut members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        members.sort();
        Ok(members)
    }

    pub async fn zrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> EngineResult<Vec<(String, i64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = i64::try_from(offset).unwrap_or(i64::MAX);
        let stop = i64::try_from(offset.saturating_add(limit))
            .map(|end| end - 1)
            .unwrap_or(-1);
        let mut conn = self.connection_manager.clone();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    pub async fn schedule_job(
        &self,
        jobs_key: &str,
        payload_key: &str,
        job_id: &str,
        payload: &str,
        run_at_ms: i64,
    ) -> EngineResult<()> {
        let mut conn = self.connection_manager.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(payload_key)
            .arg(payload)
            .ignore()
            .cmd("ZADD")
            .arg(jobs_key)
            .arg(run_at_ms)
            .arg(job_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn delete_job(&self, jobs_key: &str, payload_key: &str, job_id: &str) -> EngineResult<()> {
        let mut conn = self.connection_manager.clone();
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(payload_key)
            .ignore()
            .cmd("ZREM")
            .arg(jobs_key)
            .arg(job_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn claim_due_jobs(
        &self,
        jobs_key: &str,
        payload_key_prefix: &str,
        now_ms: i64,
        limit: usize,
        visible_again_ms: i64,
    ) -> EngineResult<Vec<(String, String)>> {
        let mut conn = self.connection_manager.clone();
        let flat: Vec<String> = self
            .scripts
            .claim_due_jobs
            .key(jobs_key)
            .arg(now_ms)
            .arg(limit)
            .arg(visible_again_ms)
            .arg(payload_key_prefix)
            .invoke_async(&mut conn)
            .await?;
        Ok(flat
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect())
    }

    pub async fn settle_job(
        &self,
        jobs_key: &str,
        payload_key: &str,
        job_id: &str,
        expected_payload: &str,
        replacement: Option<(&str, i64)>,
    ) -> EngineResult<bool> {
        let mut conn = self.connection_manager.clone();
        let (payload, run_at_ms) = replacement.unwrap_or(("", 0));
        let settled: i64 = self
            .scripts
            .settle_job
            .key(jobs_key)
            .key(payload_key)
            .arg(expected_payload)
            .arg(job_id)
            .arg(payload)
            .arg(run_at_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(settled == 1)
    }
}
