//! Redis lock backend.
//!
//! Each resource is a key set with `SET NX PX` to a random token. A
//! background task extends held keys at half their TTL, and release deletes
//! a key only if it still carries our token.
//! Requires the `redis-lock` feature flag.

use crate::config::RunLockConfig;
use crate::error::{EngineError, EngineResult};
use crate::logging::redact_url;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisLockBackend {
    connection_manager: ConnectionManager,
    release_script: Arc<Script>,
    extend_script: Arc<Script>,
    lock_ttl: Duration,
    retry_delay: Duration,
}

impl std::fmt::Debug for RedisLockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockBackend")
            .field("connection_manager", &"ConnectionManager")
            .field("lock_ttl", &self.lock_ttl)
            .finish()
    }
}

/// Locks taken by one [`RedisLockBackend::acquire`] call.
#[derive(Debug)]
pub struct HeldLocks {
    keys: Vec<String>,
    token: String,
    extender: JoinHandle<()>,
}

impl RedisLockBackend {
    pub async fn connect(url: &str, config: &RunLockConfig) -> EngineResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EngineError::Queue(format!("Failed to create Redis client: {e}")))?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::Queue(format!("Failed to connect to Redis: {e}")))?;

        debug!(url = %redact_url(url), "Redis lock backend connected");
        Ok(Self {
            connection_manager,
            release_script: Arc::new(Script::new(RELEASE_SCRIPT)),
            extend_script: Arc::new(Script::new(EXTEND_SCRIPT)),
            lock_ttl: Duration::from_millis(config.lock_ttl_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    async fn try_set(&self, key: &str, token: &str) -> EngineResult<bool> {
        let mut conn = self.connection_manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.lock_ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_keys(&self, keys: &[String], token: &str) {
        let mut conn = self.connection_manager.clone();
        for key in keys {
            let released: Result<i64, _> = self
                .release_script
                .key(key)
                .arg(token)
                .invoke_async(&mut conn)
                .await;
            if let Err(e) = released {
                warn!(key = %key, error = %e, "Failed to release run lock, it will expire");
            }
        }
    }

    /// Acquire every key in order. `None` when the timeout elapsed first;
    /// keys taken so far are given back.
    pub async fn acquire(&self, keys: &[String], timeout: Duration) -> EngineResult<Option<HeldLocks>> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        let mut acquired: Vec<String> = Vec::with_capacity(keys.len());

        for key in keys {
            loop {
                if self.try_set(key, &token).await? {
                    acquired.push(key.clone());
                    break;
                }
                if Instant::now() >= deadline {
                    self.delete_keys(&acquired, &token).await;
                    return Ok(None);
                }
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        let extender = self.spawn_extender(acquired.clone(), token.clone());
        Ok(Some(HeldLocks {
            keys: acquired,
            token,
            extender,
        }))
    }

    fn spawn_extender(&self, keys: Vec<String>, token: String) -> JoinHandle<()> {
        let mut conn = self.connection_manager.clone();
        let script = self.extend_script.clone();
        let ttl = self.lock_ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl / 2);
            interval.tick().await;
            loop {
                interval.tick().await;
                for key in &keys {
                    let extended: Result<i64, _> = script
                        .key(key)
                        .arg(&token)
                        .arg(ttl.as_millis() as u64)
                        .invoke_async(&mut conn)
                        .await;
                    match extended {
                        Ok(1) => {}
                        Ok(_) => warn!(key = %key, "Run lock lost before extension"),
                        Err(e) => warn!(key = %key, error = %e, "Failed to extend run lock"),
                    }
                }
            }
        })
    }

    pub async fn release(&self, held: HeldLocks) {
        held.extender.abort();
        self.delete_keys(&held.keys, &held.token).await;
    }
}
