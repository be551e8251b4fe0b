//! In-process queue backend.
//!
//! Holds strings, sorted sets and sets in one keyspace behind a single
//! mutex, and runs each script's steps while holding it, so every operation
//! is as indivisible as its Lua counterpart.

use crate::error::{EngineError, EngineResult};
use crate::run_queue::scripts::{
    AcknowledgeArgs, ConcurrencyKeys, DeadLetterArgs, DequeueArgs, DequeueKeys, DequeueOutcome,
    EnqueueArgs, EnqueueKeys, MessageKeys, NackArgs, ReleaseConcurrencyArgs,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default, Clone)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn add(&mut self, member: &str, score: i64) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn first(&self) -> Option<(i64, String)> {
        self.ordered.iter().next().cloned()
    }

    fn range_by_score(&self, max: i64, limit: usize) -> Vec<(String, i64)> {
        self.ordered
            .iter()
            .take_while(|(score, _)| *score <= max)
            .take(limit)
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    strings: HashMap<String, String>,
    zsets: HashMap<String, SortedSet>,
    sets: HashMap<String, HashSet<String>>,
}

impl Keyspace {
    fn zadd(&mut self, key: &str, member: &str, score: i64) {
        self.zsets.entry(key.to_string()).or_default().add(member, score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.len() == 0 {
            self.zsets.remove(key);
        }
        removed
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn scard(&self, key: &str) -> u64 {
        self.sets.get(key).map(|s| s.len() as u64).unwrap_or(0)
    }

    fn rebalance(&mut self, queue_key: &str, master_queue_key: &str, queue_name: &str) {
        match self.zsets.get(queue_key).and_then(SortedSet::first) {
            Some((score, _)) => self.zadd(master_queue_key, queue_name, score),
            None => {
                self.zrem(master_queue_key, queue_name);
            }
        }
    }

    fn release_all<K: AsRef<str>>(&mut self, keys: &[K], member: &str) {
        for key in keys {
            self.srem(key.as_ref(), member);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    keyspace: Mutex<Keyspace>,
    nack_outage: AtomicBool,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, nacks fail the way a dropped Redis connection does.
    pub fn set_nack_outage(&self, failing: bool) {
        self.nack_outage.store(failing, Ordering::SeqCst);
    }

    pub async fn enqueue(&self, keys: &EnqueueKeys, args: &EnqueueArgs) -> EngineResult<()> {
        let mut ks = self.keyspace.lock();
        ks.strings
            .insert(keys.message_key.clone(), args.message_data.clone());
        ks.zadd(&keys.queue_key, &args.run_id, args.score);
        ks.rebalance(&keys.queue_key, &keys.master_queue_key, &args.queue_name);
        ks.release_all(
            &[
                &keys.queue_current_concurrency_key,
                &keys.env_current_concurrency_key,
                &keys.project_current_concurrency_key,
                &keys.task_current_concurrency_key,
            ],
            &args.run_id,
        );
        Ok(())
    }

    /// Earliest due member of a queue.
    pub async fn peek_due(&self, queue_key: &str, now_ms: i64) -> EngineResult<Option<String>> {
        Ok(self
            .keyspace
            .lock()
            .zsets
            .get(queue_key)
            .and_then(|set| set.range_by_score(now_ms, 1).into_iter().next())
            .map(|(member, _)| member))
    }

    pub async fn dequeue(
        &self,
        keys: &DequeueKeys,
        args: &DequeueArgs,
    ) -> EngineResult<DequeueOutcome> {
        let mut ks = self.keyspace.lock();

        let env_limit = ks
            .strings
            .get(&keys.env_concurrency_limit_key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(args.default_env_concurrency as u64);
        if ks.scard(&keys.env_current_concurrency_key) >= env_limit {
            return Ok(DequeueOutcome::Empty);
        }

        let queue_limit = ks
            .strings
            .get(&keys.queue_concurrency_limit_key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1_000_000)
            .min(env_limit);
        if ks.scard(&keys.queue_current_concurrency_key) >= queue_limit {
            return Ok(DequeueOutcome::Empty);
        }

        let due = ks
            .zsets
            .get(&keys.queue_key)
            .map(|set| set.range_by_score(args.now_ms, 1))
            .unwrap_or_default();
        let Some((run_id, _)) = due.into_iter().next() else {
            return Ok(DequeueOutcome::Empty);
        };
        if run_id != args.run_id {
            return Ok(DequeueOutcome::HeadMoved);
        }

        let payload = ks.strings.get(&keys.message_key).cloned();
        ks.zrem(&keys.queue_key, &run_id);
        ks.rebalance(&keys.queue_key, &keys.master_queue_key, &args.queue_name);

        let decodable = payload
            .as_deref()
            .is_some_and(|p| serde_json::from_str::<serde_json::Value>(p).is_ok());
        if decodable {
            ks.sadd(&keys.queue_current_concurrency_key, &run_id);
            ks.sadd(&keys.env_current_concurrency_key, &run_id);
            ks.sadd(&keys.project_current_concurrency_key, &run_id);
            if let Some(task_key) = &keys.task_current_concurrency_key {
                ks.sadd(task_key, &run_id);
            }
        }

        Ok(DequeueOutcome::Dequeued { run_id, payload })
    }

    pub async fn acknowledge(&self, keys: &MessageKeys, args: &AcknowledgeArgs) -> EngineResult<()> {
        let mut ks = self.keyspace.lock();
        ks.strings.remove(&keys.message_key);
        ks.zrem(&keys.queue_key, &args.run_id);
        ks.rebalance(&keys.queue_key, &keys.master_queue_key, &args.queue_name);
        ks.release_all(
            &[
                &keys.queue_current_concurrency_key,
                &keys.env_current_concurrency_key,
                &keys.project_current_concurrency_key,
                &keys.task_current_concurrency_key,
            ],
            &args.run_id,
        );
        Ok(())
    }

    pub async fn nack(&self, keys: &MessageKeys, args: &NackArgs) -> EngineResult<bool> {
        if self.nack_outage.load(Ordering::SeqCst) {
            return Err(EngineError::Queue(format!(
                "Connection lost while nacking run {}",
                args.run_id
            )));
        }
        let mut ks = self.keyspace.lock();
        if !ks.strings.contains_key(&keys.message_key) {
            return Ok(false);
        }
        ks.strings
            .insert(keys.message_key.clone(), args.message_data.clone());
        ks.release_all(
            &[
                &keys.queue_current_concurrency_key,
                &keys.env_current_concurrency_key,
                &keys.project_current_concurrency_key,
                &keys.task_current_concurrency_key,
            ],
            &args.run_id,
        );
        ks.zadd(&keys.queue_key, &args.run_id, args.score);
        ks.rebalance(&keys.queue_key, &keys.master_queue_key, &args.queue_name);
        Ok(true)
    }

    pub async fn move_to_dead_letter(
        &self,
        keys: &MessageKeys,
        dead_letter_key: &str,
        args: &DeadLetterArgs,
    ) -> EngineResult<bool> {
        let mut ks = self.keyspace.lock();
        if !ks.strings.contains_key(&keys.message_key) {
            return Ok(false);
        }
        ks.zrem(&keys.queue_key, &args.run_id);
        ks.rebalance(&keys.queue_key, &keys.master_queue_key, &args.queue_name);
        ks.release_all(
            &[
                &keys.queue_current_concurrency_key,
                &keys.env_current_concurrency_key,
                &keys.project_current_concurrency_key,
                &keys.task_current_concurrency_key,
            ],
            &args.run_id,
        );
        ks.zadd(dead_letter_key, &args.run_id, args.now_ms);
        Ok(true)
    }

    pub async fn release_concurrency(
        &self,
        keys: &ConcurrencyKeys,
        args: &ReleaseConcurrencyArgs,
    ) -> EngineResult<()> {
        let mut ks = self.keyspace.lock();
        ks.srem(&keys.env_current_concurrency_key, &args.run_id);
        ks.srem(&keys.project_current_concurrency_key, &args.run_id);
        if args.release_queue {
            ks.srem(&keys.queue_current_concurrency_key, &args.run_id);
            ks.srem(&keys.task_current_concurrency_key, &args.run_id);
        }
        Ok(())
    }

    pub async fn reacquire_concurrency(&self, keys: &ConcurrencyKeys, run_id: &str) -> EngineResult<()> {
        let mut ks = self.keyspace.lock();
        for key in keys.to_vec() {
            ks.sadd(key, run_id);
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.keyspace.lock().strings.get(key).cloned())
    }

    pub async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        self.keyspace
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub async fn del(&self, key: &str) -> EngineResult<()> {
        self.keyspace.lock().strings.remove(key);
        Ok(())
    }

    pub async fn zcard(&self, key: &str) -> EngineResult<u64> {
        Ok(self
            .keyspace
            .lock()
            .zsets
            .get(key)
            .map(|s| s.len() as u64)
            .unwrap_or(0))
    }

    pub async fn scard(&self, key: &str) -> EngineResult<u64> {
        Ok(self.keyspace.lock().scard(key))
    }

    pub async fn smembers(&self, key: &str) -> EngineResult<Vec<String>> {
        let mut members: Vec<String> = self
            .keyspace
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    /// Members ordered by score, `limit` of them starting at rank `offset`.
    pub async fn zrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> EngineResult<Vec<(String, i64)>> {
        Ok(self
            .keyspace
            .lock()
            .zsets
            .get(key)
            .map(|s| {
                s.ordered
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .map(|(score, member)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn schedule_job(
        &self,
        jobs_key: &str,
        payload_key: &str,
        job_id: &str,
        payload: &str,
        run_at_ms: i64,
    ) -> EngineResult<()> {
        let mut ks = self.keyspace.lock();
        ks.strings
            .insert(payload_key.to_string(), payload.to_string());
        ks.zadd(jobs_key, job_id, run_at_ms);
        Ok(())
    }

    pub async fn delete_job(&self, jobs_key: &str, payload_key: &str, job_id: &str) -> EngineResult<()> {
        let mut ks = self.keyspace.lock();
        ks.strings.remove(payload_key);
        ks.zrem(jobs_key, job_id);
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
        let mut ks = self.keyspace.lock();
        let due = ks
            .zsets
            .get(jobs_key)
            .map(|s| s.range_by_score(now_ms, limit))
            .unwrap_or_default();

        let mut claimed = Vec::with_capacity(due.len());
        for (job_id, _) in due {
            match ks.strings.get(&format!("{payload_key_prefix}{job_id}")).cloned() {
                Some(payload) => {
                    ks.zadd(jobs_key, &job_id, visible_again_ms);
                    claimed.push((job_id, payload));
                }
                None => {
                    ks.zrem(jobs_key, &job_id);
                }
            }
        }
        Ok(claimed)
    }

    pub async fn settle_job(
        &self,
        jobs_key: &str,
        payload_key: &str,
        job_id: &str,
        expected_payload: &str,
        replacement: Option<(&str, i64)>,
    ) -> EngineResult<bool> {
        let mut ks = self.keyspace.lock();
        if ks.strings.get(payload_key).map(String::as_str) != Some(expected_payload) {
            return Ok(false);
        }
        match replacement {
            Some((payload, run_at_ms)) => {
                ks.strings
                    .insert(payload_key.to_string(), payload.to_string());
                ks.zadd(jobs_key, job_id, run_at_ms);
            }
            None => {
                ks.strings.remove(payload_key);
                ks.zrem(jobs_key, job_id);
            }
        }
        Ok(true)
    }
}
