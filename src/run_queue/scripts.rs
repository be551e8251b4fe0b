//! Atomic multi-key operations of the run queue.
//!
//! Each operation has a fixed key list and argument list. The Redis backend
//! runs the Lua below through `EVALSHA`; the memory backend applies the same
//! steps to its keyspace while holding one lock. Both must stay in sync.

/// Re-point a master queue at the earliest score of a child queue, or drop
/// the child from the master queue once it is empty. Expects `queueKey`,
/// `masterQueueKey` and `queueName` locals.
const REBALANCE_MASTER_QUEUE: &str = r#"
local earliest = redis.call('ZRANGE', queueKey, 0, 0, 'WITHSCORES')
if #earliest == 0 then
  redis.call('ZREM', masterQueueKey, queueName)
else
  redis.call('ZADD', masterQueueKey, earliest[2], queueName)
end
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueKeys {
    pub message_key: String,
    pub queue_key: String,
    pub master_queue_key: String,
    pub queue_current_concurrency_key: String,
    pub env_current_concurrency_key: String,
    pub project_current_concurrency_key: String,
    pub task_current_concurrency_key: String,
}

impl EnqueueKeys {
    pub fn to_vec(&self) -> Vec<&str> {
        vec![
            &self.message_key,
            &self.queue_key,
            &self.master_queue_key,
            &self.queue_current_concurrency_key,
            &self.env_current_concurrency_key,
            &self.project_current_concurrency_key,
            &self.task_current_concurrency_key,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueArgs {
    pub queue_name: String,
    pub run_id: String,
    pub message_data: String,
    pub score: i64,
}

pub const ENQUEUE_MESSAGE: &str = r#"
local messageKey = KEYS[1]
local queueKey = KEYS[2]
local masterQueueKey = KEYS[3]
local queueName = ARGV[1]
local runId = ARGV[2]

redis.call('SET', messageKey, ARGV[3])
redis.call('ZADD', queueKey, ARGV[4], runId)
__REBALANCE__
-- A run being (re)enqueued holds no slots.
redis.call('SREM', KEYS[4], runId)
redis.call('SREM', KEYS[5], runId)
redis.call('SREM', KEYS[6], runId)
redis.call('SREM', KEYS[7], runId)
return 1
"#;

/// Keys of one dequeue attempt. The caller peeks the queue head first, so
/// the message key and the task slot key are known before the script runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeueKeys {
    pub queue_key: String,
    pub queue_concurrency_limit_key: String,
    pub env_concurrency_limit_key: String,
    pub queue_current_concurrency_key: String,
    pub env_current_concurrency_key: String,
    pub project_current_concurrency_key: String,
    pub master_queue_key: String,
    pub message_key: String,
    /// `None` when the peeked message could not be decoded.
    pub task_current_concurrency_key: Option<String>,
}

impl DequeueKeys {
    pub fn to_vec(&self) -> Vec<&str> {
        let mut keys = vec![
            self.queue_key.as_str(),
            &self.queue_concurrency_limit_key,
            &self.env_concurrency_limit_key,
            &self.queue_current_concurrency_key,
            &self.env_current_concurrency_key,
            &self.project_current_concurrency_key,
            &self.master_queue_key,
            &self.message_key,
        ];
        if let Some(task_key) = &self.task_current_concurrency_key {
            keys.push(task_key);
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DequeueArgs {
    pub queue_name: String,
    pub now_ms: i64,
    pub default_env_concurrency: u32,
    /// Run id seen at the head of the queue when the keys were built.
    pub run_id: String,
}

/// Result of one dequeue script call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeueOutcome {
    /// No capacity, or nothing due.
    Empty,
    /// Another consumer took the peeked run first.
    HeadMoved,
    /// The run left the queue. `payload` is `None` when its message was gone.
    Dequeued {
        run_id: String,
        payload: Option<String>,
    },
}

impl DequeueOutcome {
    /// Decode the `{status, runId, payload}` reply of [`DEQUEUE_MESSAGE`].
    pub fn from_reply(status: i64, run_id: String, payload: String) -> Self {
        match status {
            1 => Self::HeadMoved,
            2 => Self::Dequeued {
                run_id,
                payload: Some(payload),
            },
            3 => Self::Dequeued {
                run_id,
                payload: None,
            },
            _ => Self::Empty,
        }
    }
}

/// Replies `{status, runId, payload}`: 0 empty, 1 head moved, 2 dequeued,
/// 3 dequeued without a message.
pub const DEQUEUE_MESSAGE: &str = r#"
local queueKey = KEYS[1]
local masterQueueKey = KEYS[7]
local messageKey = KEYS[8]
local taskKey = KEYS[9]
local queueName = ARGV[1]

local envLimit = tonumber(redis.call('GET', KEYS[3]) or ARGV[3])
if redis.call('SCARD', KEYS[5]) >= envLimit then
  return {0, '', ''}
end

local queueLimit = math.min(tonumber(redis.call('GET', KEYS[2]) or '1000000'), envLimit)
if redis.call('SCARD', KEYS[4]) >= queueLimit then
  return {0, '', ''}
end

local due = redis.call('ZRANGEBYSCORE', queueKey, '-inf', ARGV[2], 'LIMIT', 0, 1)
if #due == 0 then
  return {0, '', ''}
end

local runId = due[1]
if runId ~= ARGV[4] then
  return {1, runId, ''}
end

local payload = redis.call('GET', messageKey)
redis.call('ZREM', queueKey, runId)
__REBALANCE__

if not payload then
  return {3, runId, ''}
end

local ok = pcall(cjson.decode, payload)
if ok then
  redis.call('SADD', KEYS[4], runId)
  redis.call('SADD', KEYS[5], runId)
  redis.call('SADD', KEYS[6], runId)
  if taskKey then
    redis.call('SADD', taskKey, runId)
  end
end

return {2, runId, payload}
"#;

/// Keys touched when a message leaves its slots: acknowledge, nack and dead
/// letter share them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKeys {
    pub message_key: String,
    pub queue_key: String,
    pub master_queue_key: String,
    pub queue_current_concurrency_key: String,
    pub env_current_concurrency_key: String,
    pub project_current_concurrency_key: String,
    pub task_current_concurrency_key: String,
}

impl MessageKeys {
    pub fn to_vec(&self) -> Vec<&str> {
        vec![
            &self.message_key,
            &self.queue_key,
            &self.master_queue_key,
            &self.queue_current_concurrency_key,
            &self.env_current_concurrency_key,
            &self.project_current_concurrency_key,
            &self.task_current_concurrency_key,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcknowledgeArgs {
    pub queue_name: String,
    pub run_id: String,
}

pub const ACKNOWLEDGE_MESSAGE: &str = r#"
local queueKey = KEYS[2]
local masterQueueKey = KEYS[3]
local queueName = ARGV[1]
local runId = ARGV[2]

redis.call('DEL', KEYS[1])
redis.call('ZREM', queueKey, runId)
__REBALANCE__
redis.call('SREM', KEYS[4], runId)
redis.call('SREM', KEYS[5], runId)
redis.call('SREM', KEYS[6], runId)
redis.call('SREM', KEYS[7], runId)
return 1
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct NackArgs {
    pub queue_name: String,
    pub run_id: String,
    pub message_data: String,
    pub score: i64,
}

/// Returns 0 when the message no longer exists.
pub const NACK_MESSAGE: &str = r#"
local queueKey = KEYS[2]
local masterQueueKey = KEYS[3]
local queueName = ARGV[1]
local runId = ARGV[2]

if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end

redis.call('SET', KEYS[1], ARGV[3])
redis.call('SREM', KEYS[4], runId)
redis.call('SREM', KEYS[5], runId)
redis.call('SREM', KEYS[6], runId)
redis.call('SREM', KEYS[7], runId)
redis.call('ZADD', queueKey, ARGV[4], runId)
__REBALANCE__
return 1
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterArgs {
    pub queue_name: String,
    pub run_id: String,
    pub now_ms: i64,
}

/// Keys are [`MessageKeys`] followed by the dead-letter set.
pub const MOVE_TO_DEAD_LETTER: &str = r#"
local queueKey = KEYS[2]
local masterQueueKey = KEYS[3]
local queueName = ARGV[1]
local runId = ARGV[2]

if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end

redis.call('ZREM', queueKey, runId)
__REBALANCE__
redis.call('SREM', KEYS[4], runId)
redis.call('SREM', KEYS[5], runId)
redis.call('SREM', KEYS[6], runId)
redis.call('SREM', KEYS[7], runId)
redis.call('ZADD', KEYS[8], ARGV[3], runId)
return 1
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyKeys {
    pub queue_current_concurrency_key: String,
    pub env_current_concurrency_key: String,
    pub project_current_concurrency_key: String,
    pub task_current_concurrency_key: String,
}

impl ConcurrencyKeys {
    pub fn to_vec(&self) -> Vec<&str> {
        vec![
            &self.queue_current_concurrency_key,
            &self.env_current_concurrency_key,
            &self.project_current_concurrency_key,
            &self.task_current_concurrency_key,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseConcurrencyArgs {
    pub run_id: String,
    /// Also give back the queue (and task) slot, not just the environment one
    pub release_queue: bool,
}

pub const RELEASE_CONCURRENCY: &str = r#"
local runId = ARGV[1]
redis.call('SREM', KEYS[2], runId)
redis.call('SREM', KEYS[3], runId)
if ARGV[2] == '1' then
  redis.call('SREM', KEYS[1], runId)
  redis.call('SREM', KEYS[4], runId)
end
return 1
"#;

pub const REACQUIRE_CONCURRENCY: &str = r#"
local runId = ARGV[1]
redis.call('SADD', KEYS[1], runId)
redis.call('SADD', KEYS[2], runId)
redis.call('SADD', KEYS[3], runId)
redis.call('SADD', KEYS[4], runId)
return 1
"#;

/// Claims up to `ARGV[2]` due jobs by pushing their score to `ARGV[3]`, so a
/// crashed worker's jobs become due again. Returns `{id, payload, ...}`.
pub const CLAIM_DUE_JOBS: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local result = {}
for _, id in ipairs(ids) do
  local payload = redis.call('GET', ARGV[4] .. id)
  if payload then
    redis.call('ZADD', KEYS[1], ARGV[3], id)
    table.insert(result, id)
    table.insert(result, payload)
  else
    redis.call('ZREM', KEYS[1], id)
  end
end
return result
"#;

/// Deletes or reschedules a job only if its stored payload still matches.
/// `ARGV[3]` empty means delete.
pub const SETTLE_JOB: &str = r#"
local current = redis.call('GET', KEYS[2])
if current ~= ARGV[1] then
  return 0
end
if ARGV[3] == '' then
  redis.call('DEL', KEYS[2])
  redis.call('ZREM', KEYS[1], ARGV[2])
else
  redis.call('SET', KEYS[2], ARGV[3])
  redis.call('ZADD', KEYS[1], ARGV[4], ARGV[2])
end
return 1
"#;

/// Substitute the shared rebalance fragment into a script body.
pub fn render(script: &str) -> String {
    script.replace("__REBALANCE__", REBALANCE_MASTER_QUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebalance_fragment_is_inlined() {
        for script in [
            ENQUEUE_MESSAGE,
            DEQUEUE_MESSAGE,
            ACKNOWLEDGE_MESSAGE,
            NACK_MESSAGE,
            MOVE_TO_DEAD_LETTER,
        ] {
            let rendered = render(script);
            assert!(!rendered.contains("__REBALANCE__"));
            assert!(rendered.contains("ZRANGE', queueKey, 0, 0"));
        }
    }

    #[test]
    fn test_key_lists_have_fixed_arity() {
        let keys = MessageKeys {
            message_key: "m".into(),
            queue_key: "q".into(),
            master_queue_key: "mq".into(),
            queue_current_concurrency_key: "qc".into(),
            env_current_concurrency_key: "ec".into(),
            project_current_concurrency_key: "pc".into(),
            task_current_concurrency_key: "tc".into(),
        };
        assert_eq!(keys.to_vec().len(), 7);
    }

    #[test]
    fn test_dequeue_declares_message_and_task_keys() {
        let mut keys = DequeueKeys {
            queue_key: "q".into(),
            queue_concurrency_limit_key: "ql".into(),
            env_concurrency_limit_key: "el".into(),
            queue_current_concurrency_key: "qc".into(),
            env_current_concurrency_key: "ec".into(),
            project_current_concurrency_key: "pc".into(),
            master_queue_key: "mq".into(),
            message_key: "m".into(),
            task_current_concurrency_key: Some("tc".into()),
        };
        assert_eq!(keys.to_vec()[7..], ["m", "tc"]);
        keys.task_current_concurrency_key = None;
        assert_eq!(keys.to_vec().len(), 8);

        // Only KEYS are touched, never a key assembled from ARGV.
        assert!(!DEQUEUE_MESSAGE.contains("ARGV[4] .."));
        assert!(!DEQUEUE_MESSAGE.contains("ARGV[5]"));
    }

    #[test]
    fn test_dequeue_reply_decoding() {
        assert_eq!(
            DequeueOutcome::from_reply(0, String::new(), String::new()),
            DequeueOutcome::Empty
        );
        assert_eq!(
            DequeueOutcome::from_reply(1, "r".into(), String::new()),
            DequeueOutcome::HeadMoved
        );
        assert_eq!(
            DequeueOutcome::from_reply(3, "r".into(), String::new()),
            DequeueOutcome::Dequeued {
                run_id: "r".into(),
                payload: None
            }
        );
    }
}
