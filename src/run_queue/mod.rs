//! # Run Queue
//!
//! Concurrency-limited priority queue over runs. There is one sorted set per
//! (environment, queue, concurrency key), scored by the time a run becomes
//! due, and a master queue per worker pool that points at every non-empty
//! child queue with its earliest score.
//!
//! Every multi-key operation is one atomic script (see [`scripts`]), so many
//! consumers can dequeue concurrently without overrunning queue, environment
//! or project ceilings. Ceilings are enforced only through set membership in
//! the backend; no in-process counter is trusted.

pub mod backend;
pub mod keys;
pub mod message;
pub mod scripts;
pub mod strategy;

pub use backend::{MemoryQueueStore, QueueBackend};
pub use keys::{KeyProducer, QueueDescriptor};
pub use message::{DequeuedQueueMessage, QueueMessage};
pub use strategy::{
    OldestFirstStrategy, QueueCandidate, QueuePriorityStrategy, WeightedAgeCapacityStrategy,
};

use crate::config::RunQueueConfig;
use crate::error::EngineResult;
use crate::models::AuthenticatedEnvironment;
use chrono::{DateTime, Utc};
use scripts::{
    AcknowledgeArgs, ConcurrencyKeys, DeadLetterArgs, DequeueArgs, DequeueKeys, DequeueOutcome,
    EnqueueArgs, EnqueueKeys, MessageKeys, NackArgs, ReleaseConcurrencyArgs,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Queue limit assumed when none has been stored.
const UNLIMITED_QUEUE_CONCURRENCY: u64 = 1_000_000;

/// Times a queue head may be taken by another consumer before we move on.
const MAX_HEAD_RACES: u32 = 3;

#[derive(Debug, Clone)]
pub struct RunQueue {
    keys: KeyProducer,
    backend: QueueBackend,
    strategy: Arc<dyn QueuePriorityStrategy>,
    config: RunQueueConfig,
}

impl RunQueue {
    pub fn new(
        config: RunQueueConfig,
        backend: QueueBackend,
        strategy: Arc<dyn QueuePriorityStrategy>,
    ) -> Self {
        Self {
            keys: KeyProducer::new(config.key_prefix.clone()),
            backend,
            strategy,
            config,
        }
    }

    /// In-memory queue with the default weighted strategy.
    pub fn in_memory(config: RunQueueConfig) -> Self {
        Self::new(
            config,
            QueueBackend::memory(),
            Arc::new(WeightedAgeCapacityStrategy::default()),
        )
    }

    pub fn keys(&self) -> &KeyProducer {
        &self.keys
    }

    pub fn backend(&self) -> &QueueBackend {
        &self.backend
    }

    pub fn config(&self) -> &RunQueueConfig {
        &self.config
    }

    fn message_keys(&self, message: &QueueMessage) -> MessageKeys {
        let descriptor = message.descriptor();
        MessageKeys {
            message_key: self.keys.message_key(message.organization_id, message.run_id),
            queue_key: self.keys.queue_key_from_descriptor(&descriptor),
            master_queue_key: self.keys.master_queue_key(&message.master_queue),
            queue_current_concurrency_key: self.keys.queue_current_concurrency_key(&descriptor),
            env_current_concurrency_key: self.keys.env_current_concurrency_key(
                message.organization_id,
                message.project_id,
                message.environment_id,
            ),
            project_current_concurrency_key: self
                .keys
                .project_current_concurrency_key(message.organization_id, message.project_id),
            task_current_concurrency_key: self.keys.task_current_concurrency_key(
                message.organization_id,
                message.project_id,
                message.environment_id,
                &message.task_identifier,
            ),
        }
    }

    fn concurrency_keys(&self, message: &QueueMessage) -> ConcurrencyKeys {
        let keys = self.message_keys(message);
        ConcurrencyKeys {
            queue_current_concurrency_key: keys.queue_current_concurrency_key,
            env_current_concurrency_key: keys.env_current_concurrency_key,
            project_current_concurrency_key: keys.project_current_concurrency_key,
            task_current_concurrency_key: keys.task_current_concurrency_key,
        }
    }

    /// Write the message and add the run to its queue at `message.timestamp`.
    #[instrument(skip(self, env, message), fields(run_id = %message.run_id, queue = %message.queue))]
    pub async fn enqueue_message(
        &self,
        env: &AuthenticatedEnvironment,
        mut message: QueueMessage,
        master_queue: &str,
    ) -> EngineResult<()> {
        message.organization_id = env.organization_id;
        message.project_id = env.project_id;
        message.environment_id = env.id;
        message.environment_type = env.env_type;
        message.master_queue = master_queue.to_string();

        let message_keys = self.message_keys(&message);
        let keys = EnqueueKeys {
            message_key: message_keys.message_key,
            queue_key: message_keys.queue_key.clone(),
            master_queue_key: message_keys.master_queue_key,
            queue_current_concurrency_key: message_keys.queue_current_concurrency_key,
            env_current_concurrency_key: message_keys.env_current_concurrency_key,
            project_current_concurrency_key: message_keys.project_current_concurrency_key,
            task_current_concurrency_key: message_keys.task_current_concurrency_key,
        };
        let args = EnqueueArgs {
            queue_name: message_keys.queue_key,
            run_id: message.run_id.to_string(),
            message_data: serde_json::to_string(&message)?,
            score: message.timestamp,
        };

        self.backend.enqueue(&keys, &args).await?;
        debug!(master_queue = %master_queue, score = message.timestamp, "Enqueued run");
        Ok(())
    }

    /// Capacity of one child queue, or `None` when its key is not ours.
    async fn queue_candidate(
        &self,
        queue_key: &str,
        score: i64,
        now_ms: i64,
    ) -> EngineResult<Option<QueueCandidate>> {
        let Some(descriptor) = self.keys.parse_queue_key(queue_key) else {
            return Ok(None);
        };
        let (env_limit, queue_limit) = self.limits_for(&descriptor).await?;

        let env_current = self
            .backend
            .scard(&self.keys.env_current_concurrency_key(
                descriptor.organization_id,
                descriptor.project_id,
                descriptor.environment_id,
            ))
            .await?;
        let queue_current = self
            .backend
            .scard(&self.keys.queue_current_concurrency_key(&descriptor))
            .await?;

        let available = env_limit
            .saturating_sub(env_current)
            .min(queue_limit.saturating_sub(queue_current));

        Ok(Some(QueueCandidate {
            queue_key: queue_key.to_string(),
            age_ms: now_ms - score,
            available_capacity: available,
        }))
    }

    async fn limits_for(&self, descriptor: &QueueDescriptor) -> EngineResult<(u64, u64)> {
        let env_limit = self
            .backend
            .get(&self.keys.env_concurrency_limit_key(
                descriptor.organization_id,
                descriptor.project_id,
                descriptor.environment_id,
            ))
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(self.config.default_env_concurrency as u64);
        let queue_limit = self
            .backend
            .get(&self.keys.queue_concurrency_limit_key(descriptor))
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(UNLIMITED_QUEUE_CONCURRENCY)
            .min(env_limit);
        Ok((env_limit, queue_limit))
    }

    /// Due child queues of a master queue with their spare capacity.
    ///
    /// Pages through the master queue `candidate_limit` entries at a time and
    /// stops at the first page holding a queue with capacity, so queues at
    /// their limit never hide the ones behind them.
    async fn due_candidates(
        &self,
        master_queue_key: &str,
        now_ms: i64,
    ) -> EngineResult<Vec<QueueCandidate>> {
        let page_size = self.config.candidate_limit.max(1);
        let mut offset = 0;
        loop {
            let entries = self
                .backend
                .zrange_with_scores(master_queue_key, offset, page_size)
                .await?;
            let exhausted = entries.len() < page_size;

            let mut candidates = Vec::with_capacity(entries.len());
            let mut reached_future = false;
            for (queue_key, score) in entries {
                // The master queue is ordered by score; the rest are not due.
                if score > now_ms {
                    reached_future = true;
                    break;
                }
                match self.queue_candidate(&queue_key, score, now_ms).await? {
                    Some(candidate) => candidates.push(candidate),
                    None => warn!(queue_key = %queue_key, "Master queue entry is not a queue key"),
                }
            }

            if exhausted
                || reached_future
                || candidates.iter().any(|c| c.available_capacity > 0)
            {
                return Ok(candidates);
            }
            offset += page_size;
        }
    }

    /// Dequeue up to `max_count` runs from the child queues of a master queue.
    ///
    /// Returns an empty list when nothing is due or no queue has capacity;
    /// callers poll again later.
    #[instrument(skip(self), fields(consumer_id = %consumer_id))]
    pub async fn dequeue_message_in_shared_queue(
        &self,
        consumer_id: &str,
        master_queue: &str,
        max_count: usize,
    ) -> EngineResult<Vec<DequeuedQueueMessage>> {
        let now_ms = Utc::now().timestamp_millis();
        let master_queue_key = self.keys.master_queue_key(master_queue);

        let candidates = self.due_candidates(&master_queue_key, now_ms).await?;
        let ordered = self.strategy.choose_queues(&candidates, consumer_id);
        let mut dequeued = Vec::new();

        for queue_key in ordered {
            if dequeued.len() >= max_count {
                break;
            }
            let Some(descriptor) = self.keys.parse_queue_key(&queue_key) else {
                continue;
            };
            self.dequeue_from_queue(
                &queue_key,
                &descriptor,
                &master_queue_key,
                now_ms,
                max_count,
                &mut dequeued,
            )
            .await?;
        }

        if !dequeued.is_empty() {
            debug!(count = dequeued.len(), master_queue = %master_queue, "Dequeued runs");
        }
        Ok(dequeued)
    }

    /// Pop due runs from one child queue until it is empty, out of capacity,
    /// or `dequeued` holds `max_count` runs.
    async fn dequeue_from_queue(
        &self,
        queue_key: &str,
        descriptor: &QueueDescriptor,
        master_queue_key: &str,
        now_ms: i64,
        max_count: usize,
        dequeued: &mut Vec<DequeuedQueueMessage>,
    ) -> EngineResult<()> {
        let (org, project, env) = (
            descriptor.organization_id,
            descriptor.project_id,
            descriptor.environment_id,
        );
        let mut head_races = 0;

        while dequeued.len() < max_count {
            let Some(run_id) = self.backend.peek_due(queue_key, now_ms).await? else {
                return Ok(());
            };
            let message_key = format!("{}{run_id}", self.keys.message_key_prefix(org));
            let task_identifier = self
                .backend
                .get(&message_key)
                .await?
                .and_then(|payload| serde_json::from_str::<QueueMessage>(&payload).ok())
                .map(|message| message.task_identifier);

            let keys = DequeueKeys {
                queue_key: queue_key.to_string(),
                queue_concurrency_limit_key: self.keys.queue_concurrency_limit_key(descriptor),
                env_concurrency_limit_key: self.keys.env_concurrency_limit_key(org, project, env),
                queue_current_concurrency_key: self.keys.queue_current_concurrency_key(descriptor),
                env_current_concurrency_key: self.keys.env_current_concurrency_key(org, project, env),
                project_current_concurrency_key: self
                    .keys
                    .project_current_concurrency_key(org, project),
                master_queue_key: master_queue_key.to_string(),
                message_key,
                task_current_concurrency_key: task_identifier.map(|task| {
                    self.keys
                        .task_current_concurrency_key(org, project, env, &task)
                }),
            };
            let args = DequeueArgs {
                queue_name: queue_key.to_string(),
                now_ms,
                default_env_concurrency: self.config.default_env_concurrency,
                run_id: run_id.clone(),
            };

            match self.backend.dequeue(&keys, &args).await? {
                DequeueOutcome::Empty => return Ok(()),
                DequeueOutcome::HeadMoved => {
                    head_races += 1;
                    if head_races >= MAX_HEAD_RACES {
                        debug!(queue_key = %queue_key, "Queue head kept moving, trying other queues");
                        return Ok(());
                    }
                }
                DequeueOutcome::Dequeued {
                    run_id,
                    payload: None,
                } => {
                    debug!(run_id = %run_id, queue_key = %queue_key, "Dropped queue entry without a message");
                }
                DequeueOutcome::Dequeued {
                    run_id,
                    payload: Some(payload),
                } => match serde_json::from_str::<QueueMessage>(&payload) {
                    Ok(message) => dequeued.push(DequeuedQueueMessage {
                        message_id: message.run_id,
                        message,
                    }),
                    Err(e) => {
                        warn!(
                            run_id = %run_id,
                            queue_key = %queue_key,
                            error = %e,
                            "Failed to decode queue message, treating as absent"
                        );
                    }
                },
            }
        }
        Ok(())
    }

    /// Stored message of a run, `None` if absent or undecodable.
    pub async fn read_message(&self, org_id: Uuid, run_id: Uuid) -> EngineResult<Option<QueueMessage>> {
        let Some(payload) = self.backend.get(&self.keys.message_key(org_id, run_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&payload) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to decode queue message");
                Ok(None)
            }
        }
    }

    /// Remove a run from the queue for good and free all its slots.
    #[instrument(skip(self))]
    pub async fn acknowledge_message(&self, org_id: Uuid, run_id: Uuid) -> EngineResult<()> {
        let Some(message) = self.read_message(org_id, run_id).await? else {
            debug!(run_id = %run_id, "Acknowledge of a run with no queue message");
            return Ok(());
        };
        let keys = self.message_keys(&message);
        let args = AcknowledgeArgs {
            queue_name: keys.queue_key.clone(),
            run_id: run_id.to_string(),
        };
        self.backend.acknowledge(&keys, &args).await
    }

    /// Put a dequeued run back into its queue, due at `retry_at` (now when
    /// `None`). Returns false when the message is gone or has been nacked too
    /// often, in which case it is dead-lettered.
    #[instrument(skip(self))]
    pub async fn nack_message(
        &self,
        org_id: Uuid,
        run_id: Uuid,
        retry_at: Option<DateTime<Utc>>,
    ) -> EngineResult<bool> {
        self.return_to_queue(org_id, run_id, retry_at, true).await
    }

    /// Put a run whose attempt failed back into its queue for a scheduled
    /// retry. Retries are bounded by the run's own attempt limit, so this
    /// does not count against `max_nack_attempts`. Returns false when the
    /// message is gone.
    #[instrument(skip(self))]
    pub async fn requeue_for_retry(
        &self,
        org_id: Uuid,
        run_id: Uuid,
        retry_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        self.return_to_queue(org_id, run_id, Some(retry_at), false)
            .await
    }

    async fn return_to_queue(
        &self,
        org_id: Uuid,
        run_id: Uuid,
        retry_at: Option<DateTime<Utc>>,
        count_nack: bool,
    ) -> EngineResult<bool> {
        let Some(mut message) = self.read_message(org_id, run_id).await? else {
            return Ok(false);
        };
        let keys = self.message_keys(&message);
        let now = Utc::now();

        if count_nack {
            message.attempt += 1;
        }
        if message.attempt > self.config.max_nack_attempts {
            let dead_letter_key = self.keys.dead_letter_key(
                message.organization_id,
                message.project_id,
                message.environment_id,
            );
            let args = DeadLetterArgs {
                queue_name: keys.queue_key.clone(),
                run_id: run_id.to_string(),
                now_ms: now.timestamp_millis(),
            };
            self.backend
                .move_to_dead_letter(&keys, &dead_letter_key, &args)
                .await?;
            warn!(run_id = %run_id, attempts = message.attempt, "Run exceeded nack attempts, moved to dead letter");
            return Ok(false);
        }

        message.timestamp = retry_at.unwrap_or(now).timestamp_millis();
        let args = NackArgs {
            queue_name: keys.queue_key.clone(),
            run_id: run_id.to_string(),
            message_data: serde_json::to_string(&message)?,
            score: message.timestamp,
        };
        self.backend.nack(&keys, &args).await
    }

    /// Free the run's environment and project slots, and its queue and task
    /// slots too when `release_queue` is set.
    pub async fn release_concurrency(
        &self,
        org_id: Uuid,
        run_id: Uuid,
        release_queue: bool,
    ) -> EngineResult<bool> {
        let Some(message) = self.read_message(org_id, run_id).await? else {
            return Ok(false);
        };
        let args = ReleaseConcurrencyArgs {
            run_id: run_id.to_string(),
            release_queue,
        };
        self.backend
            .release_concurrency(&self.concurrency_keys(&message), &args)
            .await?;
        Ok(true)
    }

    pub async fn reacquire_concurrency(&self, org_id: Uuid, run_id: Uuid) -> EngineResult<bool> {
        let Some(message) = self.read_message(org_id, run_id).await? else {
            return Ok(false);
        };
        self.backend
            .reacquire_concurrency(&self.concurrency_keys(&message), &run_id.to_string())
            .await?;
        Ok(true)
    }

    pub async fn update_queue_concurrency_limits(
        &self,
        env: &AuthenticatedEnvironment,
        queue: &str,
        limit: u32,
    ) -> EngineResult<()> {
        let descriptor = self.descriptor(env, queue, None);
        self.backend
            .set(&self.keys.queue_concurrency_limit_key(&descriptor), &limit.to_string())
            .await?;
        info!(queue = %queue, limit, "Updated queue concurrency limit");
        Ok(())
    }

    pub async fn remove_queue_concurrency_limits(
        &self,
        env: &AuthenticatedEnvironment,
        queue: &str,
    ) -> EngineResult<()> {
        let descriptor = self.descriptor(env, queue, None);
        self.backend
            .del(&self.keys.queue_concurrency_limit_key(&descriptor))
            .await
    }

    /// Store the environment's ceiling, or the default when it has none.
    pub async fn update_env_concurrency_limits(&self, env: &AuthenticatedEnvironment) -> EngineResult<()> {
        let limit = env
            .maximum_concurrency_limit
            .unwrap_or(self.config.default_env_concurrency);
        self.backend
            .set(
                &self
                    .keys
                    .env_concurrency_limit_key(env.organization_id, env.project_id, env.id),
                &limit.to_string(),
            )
            .await
    }

    fn descriptor(
        &self,
        env: &AuthenticatedEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> QueueDescriptor {
        QueueDescriptor {
            organization_id: env.organization_id,
            project_id: env.project_id,
            environment_id: env.id,
            queue: queue.to_string(),
            concurrency_key: concurrency_key.map(str::to_string),
        }
    }

    pub async fn length_of_queue(
        &self,
        env: &AuthenticatedEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> EngineResult<u64> {
        self.backend
            .zcard(&self.keys.queue_key(env, queue, concurrency_key))
            .await
    }

    pub async fn current_concurrency_of_queue(
        &self,
        env: &AuthenticatedEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> EngineResult<u64> {
        let descriptor = self.descriptor(env, queue, concurrency_key);
        self.backend
            .scard(&self.keys.queue_current_concurrency_key(&descriptor))
            .await
    }

    pub async fn current_concurrency_of_environment(
        &self,
        env: &AuthenticatedEnvironment,
    ) -> EngineResult<u64> {
        self.backend
            .scard(
                &self
                    .keys
                    .env_current_concurrency_key(env.organization_id, env.project_id, env.id),
            )
            .await
    }

    pub async fn current_concurrency_of_project(
        &self,
        env: &AuthenticatedEnvironment,
    ) -> EngineResult<u64> {
        self.backend
            .scard(
                &self
                    .keys
                    .project_current_concurrency_key(env.organization_id, env.project_id),
            )
            .await
    }

    pub async fn current_concurrency_of_task(
        &self,
        env: &AuthenticatedEnvironment,
        task_identifier: &str,
    ) -> EngineResult<u64> {
        self.backend
            .scard(&self.keys.task_current_concurrency_key(
                env.organization_id,
                env.project_id,
                env.id,
                task_identifier,
            ))
            .await
    }

    /// Runs currently holding a slot in the environment.
    pub async fn currently_executing_in_environment(
        &self,
        env: &AuthenticatedEnvironment,
    ) -> EngineResult<Vec<String>> {
        self.backend
            .smembers(
                &self
                    .keys
                    .env_current_concurrency_key(env.organization_id, env.project_id, env.id),
            )
            .await
    }

    /// Score of the earliest message in a queue.
    pub async fn oldest_message_in_queue(
        &self,
        env: &AuthenticatedEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> EngineResult<Option<i64>> {
        let entries = self
            .backend
            .zrange_with_scores(&self.keys.queue_key(env, queue, concurrency_key), 0, 1)
            .await?;
        Ok(entries.first().map(|(_, score)| *score))
    }

    /// Earliest score the master queue holds for a child queue.
    pub async fn master_queue_entries(&self, master_queue: &str) -> EngineResult<Vec<(String, i64)>> {
        self.backend
            .zrange_with_scores(&self.keys.master_queue_key(master_queue), 0, usize::MAX)
            .await
    }

    /// Number of messages dead-lettered in an environment.
    pub async fn dead_letter_count(&self, env: &AuthenticatedEnvironment) -> EngineResult<u64> {
        self.backend
            .zcard(
                &self
                    .keys
                    .dead_letter_key(env.organization_id, env.project_id, env.id),
            )
            .await
    }

    pub async fn quit(&self) -> EngineResult<()> {
        info!(backend = self.backend.provider_name(), "Run queue shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuntimeEnvironmentType;

    const MASTER: &str = "main";

    fn queue() -> RunQueue {
        RunQueue::new(
            RunQueueConfig {
                max_nack_attempts: 2,
                ..RunQueueConfig::default()
            },
            QueueBackend::memory(),
            Arc::new(OldestFirstStrategy),
        )
    }

    fn message(env: &AuthenticatedEnvironment, queue: &str, timestamp: i64) -> QueueMessage {
        QueueMessage {
            run_id: Uuid::now_v7(),
            task_identifier: "my-task".to_string(),
            organization_id: env.organization_id,
            project_id: env.project_id,
            environment_id: env.id,
            environment_type: env.env_type,
            queue: queue.to_string(),
            concurrency_key: None,
            timestamp,
            attempt: 0,
            master_queue: MASTER.to_string(),
        }
    }

    fn past() -> i64 {
        Utc::now().timestamp_millis() - 1_000
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_acknowledge_leaves_nothing_behind() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let msg = message(&env, "task/my-task", past());
        rq.enqueue_message(&env, msg.clone(), MASTER).await.unwrap();

        assert_eq!(rq.length_of_queue(&env, "task/my-task", None).await.unwrap(), 1);
        assert_eq!(rq.master_queue_entries(MASTER).await.unwrap().len(), 1);

        let dequeued = rq
            .dequeue_message_in_shared_queue("consumer", MASTER, 10)
            .await
            .unwrap();
        assert_eq!(dequeued.len(), 1);
        assert_eq!(dequeued[0].message.run_id, msg.run_id);
        assert_eq!(rq.current_concurrency_of_environment(&env).await.unwrap(), 1);
        assert_eq!(rq.current_concurrency_of_project(&env).await.unwrap(), 1);
        assert_eq!(rq.current_concurrency_of_task(&env, "my-task").await.unwrap(), 1);
        assert!(rq.master_queue_entries(MASTER).await.unwrap().is_empty());

        rq.acknowledge_message(env.organization_id, msg.run_id)
            .await
            .unwrap();
        assert_eq!(rq.current_concurrency_of_queue(&env, "task/my-task", None).await.unwrap(), 0);
        assert_eq!(rq.current_concurrency_of_environment(&env).await.unwrap(), 0);
        assert_eq!(rq.current_concurrency_of_task(&env, "my-task").await.unwrap(), 0);
        assert!(rq.read_message(env.organization_id, msg.run_id).await.unwrap().is_none());
        assert!(rq.master_queue_entries(MASTER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_limit_caps_dequeue() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        rq.update_queue_concurrency_limits(&env, "q", 1).await.unwrap();
        for _ in 0..3 {
            rq.enqueue_message(&env, message(&env, "q", past()), MASTER)
                .await
                .unwrap();
        }

        let first = rq.dequeue_message_in_shared_queue("c", MASTER, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = rq.dequeue_message_in_shared_queue("c", MASTER, 10).await.unwrap();
        assert!(second.is_empty());

        rq.remove_queue_concurrency_limits(&env, "q").await.unwrap();
        let rest = rq.dequeue_message_in_shared_queue("c", MASTER, 10).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn test_environment_limit_spans_queues() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Development)
            .with_concurrency_limit(2);
        rq.update_env_concurrency_limits(&env).await.unwrap();
        for name in ["a", "b", "c"] {
            rq.enqueue_message(&env, message(&env, name, past()), MASTER)
                .await
                .unwrap();
        }

        let dequeued = rq.dequeue_message_in_shared_queue("c", MASTER, 10).await.unwrap();
        assert_eq!(dequeued.len(), 2);
        assert_eq!(rq.current_concurrency_of_environment(&env).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_full_queues_do_not_hide_later_queues() {
        let rq = RunQueue::new(
            RunQueueConfig {
                candidate_limit: 2,
                ..RunQueueConfig::default()
            },
            QueueBackend::memory(),
            Arc::new(OldestFirstStrategy),
        );
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        for (offset, name) in ["full-1", "full-2", "full-3", "full-4"].into_iter().enumerate() {
            rq.update_queue_concurrency_limits(&env, name, 0).await.unwrap();
            rq.enqueue_message(&env, message(&env, name, past() - 100 + offset as i64), MASTER)
                .await
                .unwrap();
        }
        let open = message(&env, "open", past());
        rq.enqueue_message(&env, open.clone(), MASTER).await.unwrap();

        let dequeued = rq.dequeue_message_in_shared_queue("c", MASTER, 10).await.unwrap();
        assert_eq!(dequeued.len(), 1);
        assert_eq!(dequeued[0].message.run_id, open.run_id);
        assert_eq!(rq.length_of_queue(&env, "full-1", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_fills_task_slot_from_message() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let mut msg = message(&env, "q", past());
        msg.task_identifier = "resize".to_string();
        rq.enqueue_message(&env, msg.clone(), MASTER).await.unwrap();

        rq.dequeue_message_in_shared_queue("c", MASTER, 1).await.unwrap();
        assert_eq!(rq.current_concurrency_of_task(&env, "resize").await.unwrap(), 1);
        assert_eq!(rq.current_concurrency_of_task(&env, "my-task").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_future_messages_are_not_due() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let future = Utc::now().timestamp_millis() + 60_000;
        rq.enqueue_message(&env, message(&env, "q", future), MASTER)
            .await
            .unwrap();

        assert!(rq
            .dequeue_message_in_shared_queue("c", MASTER, 1)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(rq.oldest_message_in_queue(&env, "q", None).await.unwrap(), Some(future));
    }

    #[tokio::test]
    async fn test_nack_requeues_then_dead_letters() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let msg = message(&env, "q", past());
        rq.enqueue_message(&env, msg.clone(), MASTER).await.unwrap();

        for expected_attempt in 1..=2 {
            let dequeued = rq.dequeue_message_in_shared_queue("c", MASTER, 1).await.unwrap();
            assert_eq!(dequeued.len(), 1);
            assert!(rq.nack_message(env.organization_id, msg.run_id, None).await.unwrap());
            assert_eq!(rq.current_concurrency_of_environment(&env).await.unwrap(), 0);
            let stored = rq
                .read_message(env.organization_id, msg.run_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.attempt, expected_attempt);
        }

        rq.dequeue_message_in_shared_queue("c", MASTER, 1).await.unwrap();
        assert!(!rq.nack_message(env.organization_id, msg.run_id, None).await.unwrap());
        assert_eq!(rq.dead_letter_count(&env).await.unwrap(), 1);
        assert_eq!(rq.length_of_queue(&env, "q", None).await.unwrap(), 0);
        assert_eq!(rq.current_concurrency_of_environment(&env).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_requeue_does_not_count_as_nack() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let msg = message(&env, "q", past());
        rq.enqueue_message(&env, msg.clone(), MASTER).await.unwrap();

        // Well past max_nack_attempts (2).
        for _ in 0..5 {
            let dequeued = rq.dequeue_message_in_shared_queue("c", MASTER, 1).await.unwrap();
            assert_eq!(dequeued.len(), 1);
            assert!(rq
                .requeue_for_retry(env.organization_id, msg.run_id, Utc::now())
                .await
                .unwrap());
        }

        let stored = rq
            .read_message(env.organization_id, msg.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.attempt, 0);
        assert_eq!(rq.dead_letter_count(&env).await.unwrap(), 0);
        assert_eq!(rq.length_of_queue(&env, "q", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nack_of_missing_message_returns_false() {
        let rq = queue();
        assert!(!rq.nack_message(Uuid::now_v7(), Uuid::now_v7(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_nack_with_retry_at_delays_redelivery() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let msg = message(&env, "q", past());
        rq.enqueue_message(&env, msg.clone(), MASTER).await.unwrap();
        rq.dequeue_message_in_shared_queue("c", MASTER, 1).await.unwrap();

        let retry_at = Utc::now() + chrono::Duration::seconds(30);
        assert!(rq
            .nack_message(env.organization_id, msg.run_id, Some(retry_at))
            .await
            .unwrap());
        assert!(rq
            .dequeue_message_in_shared_queue("c", MASTER, 1)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            rq.master_queue_entries(MASTER).await.unwrap()[0].1,
            retry_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_undecodable_message_is_skipped() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let good = message(&env, "q", past() - 10);
        let bad = message(&env, "q", past());
        rq.enqueue_message(&env, good.clone(), MASTER).await.unwrap();
        rq.enqueue_message(&env, bad.clone(), MASTER).await.unwrap();
        rq.backend()
            .set(&rq.keys().message_key(env.organization_id, bad.run_id), "not json")
            .await
            .unwrap();

        let dequeued = rq.dequeue_message_in_shared_queue("c", MASTER, 5).await.unwrap();
        assert_eq!(dequeued.len(), 1);
        assert_eq!(dequeued[0].message.run_id, good.run_id);
        assert_eq!(rq.length_of_queue(&env, "q", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_and_reacquire_concurrency() {
        let rq = queue();
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let msg = message(&env, "q", past());
        rq.enqueue_message(&env, msg.clone(), MASTER).await.unwrap();
        rq.dequeue_message_in_shared_queue("c", MASTER, 1).await.unwrap();

        assert!(rq
            .release_concurrency(env.organization_id, msg.run_id, false)
            .await
            .unwrap());
        assert_eq!(rq.current_concurrency_of_environment(&env).await.unwrap(), 0);
        assert_eq!(rq.current_concurrency_of_queue(&env, "q", None).await.unwrap(), 1);

        assert!(rq.reacquire_concurrency(env.organization_id, msg.run_id).await.unwrap());
        assert_eq!(rq.current_concurrency_of_environment(&env).await.unwrap(), 1);
        assert_eq!(
            rq.currently_executing_in_environment(&env).await.unwrap(),
            vec![msg.run_id.to_string()]
        );
    }
}
