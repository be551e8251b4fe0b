//! Storage backends for the run queue.
//!
//! Uses enum dispatch over the available backends. The in-memory backend is
//! always present; the Redis backend requires the `redis-queue` feature.

pub mod memory;
#[cfg(feature = "redis-queue")]
pub mod redis;

use super::scripts::{
    AcknowledgeArgs, ConcurrencyKeys, DeadLetterArgs, DequeueArgs, DequeueKeys, DequeueOutcome,
    EnqueueArgs, EnqueueKeys, MessageKeys, NackArgs, ReleaseConcurrencyArgs,
};
use crate::error::EngineResult;
use std::sync::Arc;

pub use memory::MemoryQueueStore;
#[cfg(feature = "redis-queue")]
pub use self::redis::RedisQueueStore;

/// Backend holding queue keys, concurrency sets and scheduled jobs
#[derive(Debug, Clone)]
pub enum QueueBackend {
    /// Single-process keyspace, used by tests and embedded engines
    Memory(Arc<MemoryQueueStore>),

    /// Redis with Lua scripts (boxed to reduce enum size)
    #[cfg(feature = "redis-queue")]
    Redis(Box<RedisQueueStore>),
}

impl QueueBackend {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryQueueStore::new()))
    }

    #[cfg(feature = "redis-queue")]
    pub async fn redis(url: &str) -> EngineResult<Self> {
        Ok(Self::Redis(Box::new(RedisQueueStore::connect(url).await?)))
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            #[cfg(feature = "redis-queue")]
            Self::Redis(_) => "redis",
        }
    }

    pub async fn enqueue(&self, keys: &EnqueueKeys, args: &EnqueueArgs) -> EngineResult<()> {
        match self {
            Self::Memory(s) => s.enqueue(keys, args).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.enqueue(keys, args).await,
        }
    }

    /// Earliest member of a queue whose score is at most `now_ms`.
    pub async fn peek_due(&self, queue_key: &str, now_ms: i64) -> EngineResult<Option<String>> {
        match self {
            Self::Memory(s) => s.peek_due(queue_key, now_ms).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.peek_due(queue_key, now_ms).await,
        }
    }

    pub async fn dequeue(
        &self,
        keys: &DequeueKeys,
        args: &DequeueArgs,
    ) -> EngineResult<DequeueOutcome> {
        match self {
            Self::Memory(s) => s.dequeue(keys, args).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.dequeue(keys, args).await,
        }
    }

    pub async fn acknowledge(&self, keys: &MessageKeys, args: &AcknowledgeArgs) -> EngineResult<()> {
        match self {
            Self::Memory(s) => s.acknowledge(keys, args).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.acknowledge(keys, args).await,
        }
    }

    pub async fn nack(&self, keys: &MessageKeys, args: &NackArgs) -> EngineResult<bool> {
        match self {
            Self::Memory(s) => s.nack(keys, args).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.nack(keys, args).await,
        }
    }

    pub async fn move_to_dead_letter(
        &self,
        keys: &MessageKeys,
        dead_letter_key: &str,
        args: &DeadLetterArgs,
    ) -> EngineResult<bool> {
        match self {
            Self::Memory(s) => s.move_to_dead_letter(keys, dead_letter_key, args).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.move_to_dead_letter(keys, dead_letter_key, args).await,
        }
    }

    pub async fn release_concurrency(
        &self,
        keys: &ConcurrencyKeys,
        args: &ReleaseConcurrencyArgs,
    ) -> EngineResult<()> {
        match self {
            Self::Memory(s) => s.release_concurrency(keys, args).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.release_concurrency(keys, args).await,
        }
    }

    pub async fn reacquire_concurrency(&self, keys: &ConcurrencyKeys, run_id: &str) -> EngineResult<()> {
        match self {
            Self::Memory(s) => s.reacquire_concurrency(keys, run_id).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.reacquire_concurrency(keys, run_id).await,
        }
    }

    pub async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        match self {
            Self::Memory(s) => s.get(key).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.get(key).await,
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        match self {
            Self::Memory(s) => s.set(key, value).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.set(key, value).await,
        }
    }

    pub async fn del(&self, key: &str) -> EngineResult<()> {
        match self {
            Self::Memory(s) => s.del(key).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.del(key).await,
        }
    }

    pub async fn zcard(&self, key: &str) -> EngineResult<u64> {
        match self {
            Self::Memory(s) => s.zcard(key).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.zcard(key).await,
        }
    }

    pub async fn scard(&self, key: &str) -> EngineResult<u64> {
        match self {
            Self::Memory(s) => s.scard(key).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.scard(key).await,
        }
    }

    pub async fn smembers(&self, key: &str) -> EngineResult<Vec<String>> {
        match self {
            Self::Memory(s) => s.smembers(key).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.smembers(key).await,
        }
    }

    pub async fn zrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> EngineResult<Vec<(String, i64)>> {
        match self {
            Self::Memory(s) => s.zrange_with_scores(key, offset, limit).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.zrange_with_scores(key, offset, limit).await,
        }
    }

    pub async fn schedule_job(
        &self,
        jobs_key: &str,
        payload_key: &str,
        job_id: &str,
        payload: &str,
        run_at_ms: i64,
    ) -> EngineResult<()> {
        match self {
            Self::Memory(s) => {
                s.schedule_job(jobs_key, payload_key, job_id, payload, run_at_ms)
                    .await
            }
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => {
                s.schedule_job(jobs_key, payload_key, job_id, payload, run_at_ms)
                    .await
            }
        }
    }

    pub async fn delete_job(&self, jobs_key: &str, payload_key: &str, job_id: &str) -> EngineResult<()> {
        match self {
            Self::Memory(s) => s.delete_job(jobs_key, payload_key, job_id).await,
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => s.delete_job(jobs_key, payload_key, job_id).await,
        }
    }

    pub async fn claim_due_jobs(
        &self,
        jobs_key: &str,
        payload_key_prefix: &str,
        now_ms: i64,
        limit: usize,
        visible_again_ms: i64,
    ) -> EngineResult<Vec<(String, String)>> {
        match self {
            Self::Memory(s) => {
                s.claim_due_jobs(jobs_key, payload_key_prefix, now_ms, limit, visible_again_ms)
                    .await
            }
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => {
                s.claim_due_jobs(jobs_key, payload_key_prefix, now_ms, limit, visible_again_ms)
                    .await
            }
        }
    }

    pub async fn settle_job(
        &self,
        jobs_key: &str,
        payload_key: &str,
        job_id: &str,
        expected_payload: &str,
        replacement: Option<(&str, i64)>,
    ) -> EngineResult<bool> {
        match self {
            Self::Memory(s) => {
                s.settle_job(jobs_key, payload_key, job_id, expected_payload, replacement)
                    .await
            }
            #[cfg(feature = "redis-queue")]
            Self::Redis(s) => {
                s.settle_job(jobs_key, payload_key, job_id, expected_payload, replacement)
                    .await
            }
        }
    }
}
