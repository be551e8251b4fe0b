//! # Run Locks
//!
//! Mutual exclusion for state transitions. Every mutating engine operation
//! runs inside [`RunLocker::lock`] for the runs it touches, so at most one
//! transition per run is in flight across all engine instances.
//!
//! Resources are acquired in sorted order, which keeps multi-run locks
//! deadlock free. Locks are not re-entrant: code that already holds a run's
//! lock calls the `*_locked` variants of engine operations.

#[cfg(feature = "redis-lock")]
pub mod redis;

use crate::config::RunLockConfig;
use crate::error::{EngineError, EngineResult};
use crate::run_queue::KeyProducer;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

#[cfg(feature = "redis-lock")]
pub use self::redis::RedisLockBackend;

/// Per-resource async mutexes for a single process.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire(&self, keys: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(mutex.lock_owned().await);
        }
        guards
    }

    fn release(&self, keys: &[String], guards: Vec<OwnedMutexGuard<()>>) {
        drop(guards);
        for key in keys {
            self.locks
                .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }

    /// Resources currently tracked, held or not.
    pub fn tracked_resources(&self) -> usize {
        self.locks.len()
    }
}

#[derive(Debug, Clone)]
pub enum LockBackend {
    Memory(Arc<MemoryLockBackend>),
    #[cfg(feature = "redis-lock")]
    Redis(Box<RedisLockBackend>),
}

impl LockBackend {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryLockBackend::new()))
    }

    #[cfg(feature = "redis-lock")]
    pub async fn redis(url: &str, config: &RunLockConfig) -> EngineResult<Self> {
        Ok(Self::Redis(Box::new(
            RedisLockBackend::connect(url, config).await?,
        )))
    }
}

/// Acquires run-scoped locks around a critical section.
#[derive(Debug, Clone)]
pub struct RunLocker {
    backend: LockBackend,
    keys: KeyProducer,
    default_timeout: Duration,
}

impl RunLocker {
    pub fn new(backend: LockBackend, keys: KeyProducer, config: &RunLockConfig) -> Self {
        Self {
            backend,
            keys,
            default_timeout: config.timeout(),
        }
    }

    pub fn in_memory(keys: KeyProducer, config: &RunLockConfig) -> Self {
        Self::new(LockBackend::memory(), keys, config)
    }

    pub fn backend(&self) -> &LockBackend {
        &self.backend
    }

    /// Run `f` while holding the locks for every resource.
    ///
    /// Fails with [`EngineError::LockTimeout`] if the locks cannot be taken
    /// within `timeout` (the configured default when `None`).
    pub async fn lock<R, F, Fut, T>(
        &self,
        operation: &str,
        resources: &[R],
        timeout: Option<Duration>,
        f: F,
    ) -> EngineResult<T>
    where
        R: ToString,
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut names: Vec<String> = resources.iter().map(ToString::to_string).collect();
        names.sort();
        names.dedup();
        let keys: Vec<String> = names.iter().map(|n| self.keys.lock_key(n)).collect();
        let timeout = timeout.unwrap_or(self.default_timeout);

        let timed_out = || {
            warn!(operation = %operation, resources = ?names, "Timed out acquiring run lock");
            EngineError::LockTimeout {
                operation: operation.to_string(),
                resources: names.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }
        };

        match &self.backend {
            LockBackend::Memory(backend) => {
                let guards = tokio::time::timeout(timeout, backend.acquire(&keys))
                    .await
                    .map_err(|_| timed_out())?;
                debug!(operation = %operation, resources = ?names, "Run lock acquired");
                let result = f().await;
                backend.release(&keys, guards);
                result
            }
            #[cfg(feature = "redis-lock")]
            LockBackend::Redis(backend) => {
                let held = backend
                    .acquire(&keys, timeout)
                    .await?
                    .ok_or_else(timed_out)?;
                debug!(operation = %operation, resources = ?names, "Run lock acquired");
                let result = f().await;
                backend.release(held).await;
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn locker(timeout_ms: u64) -> RunLocker {
        RunLocker::in_memory(
            KeyProducer::new("test:"),
            &RunLockConfig {
                timeout_ms,
                ..RunLockConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_lock_serializes_same_run() {
        let locker = locker(5_000);
        let run_id = Uuid::now_v7();
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locker = locker.clone();
            let in_section = in_section.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                locker
                    .lock("test", &[run_id], None, || async {
                        let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        in_section.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_times_out_while_held() {
        let locker = locker(20);
        let run_id = Uuid::now_v7();
        let inner = locker.clone();

        let result = locker
            .lock("outer", &[run_id], None, || async move {
                inner
                    .lock("inner", &[run_id], None, || async { Ok(()) })
                    .await
            })
            .await;

        match result {
            Err(EngineError::LockTimeout { operation, .. }) => assert_eq!(operation, "inner"),
            other => panic!("expected lock timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multi_resource_locks_do_not_deadlock() {
        let locker = locker(2_000);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        let first = {
            let locker = locker.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    locker.lock("ab", &[a, b], None, || async { Ok(()) }).await?;
                }
                Ok::<_, EngineError>(())
            })
        };
        let second = {
            let locker = locker.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    locker.lock("ba", &[b, a], None, || async { Ok(()) }).await?;
                }
                Ok::<_, EngineError>(())
            })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_released_locks_are_forgotten() {
        let locker = locker(1_000);
        locker
            .lock("op", &[Uuid::now_v7()], None, || async { Ok(()) })
            .await
            .unwrap();
        match locker.backend() {
            LockBackend::Memory(backend) => assert_eq!(backend.tracked_resources(), 0),
            #[allow(unreachable_patterns)]
            _ => unreachable!(),
        }
    }
}
