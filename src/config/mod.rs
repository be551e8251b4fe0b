//! # Run Engine Configuration
//!
//! Configuration tree for the engine. Every section has a `Default` so an
//! embedded engine can start from `EngineConfig::default()`; deployed
//! processes load it through [`ConfigManager`], which layers a TOML file, an
//! environment-specific override file and `RUN_ENGINE__*` environment
//! variables.
//!
//! ```rust,no_run
//! use run_engine::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let threshold = manager.config().retry.warm_start_threshold_ms;
//! # Ok(())
//! # }
//! ```

pub mod loader;

use crate::constants::{
    DEFAULT_ENVIRONMENT_CONCURRENCY, DEFAULT_RETRY_WARM_START_THRESHOLD_MS,
    DEFAULT_RUN_LOCK_TIMEOUT_MS, MAX_TASK_RUN_ATTEMPTS,
};
use crate::error::{EngineError, EngineResult};
use crate::models::MachinePreset;
use crate::retry::RetryOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use loader::ConfigManager;

/// Root configuration structure mirroring config/run-engine.toml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run queue keying and concurrency defaults
    pub queue: RunQueueConfig,

    /// Per-run distributed lock settings
    pub run_lock: RunLockConfig,

    /// Retry policy applied by the engine
    pub retry: RetryConfig,

    /// Heartbeat timeouts per execution status
    pub heartbeat: HeartbeatConfig,

    /// Machine presets available to runs
    pub machines: MachinesConfig,

    /// Scheduled job worker
    pub worker: WorkerConfig,

    /// Batch fan-in policy
    pub batch: BatchConfig,

    /// Trigger debouncing
    pub debounce: DebounceConfig,

    /// Concurrency release while runs are blocked on waitpoints
    pub release_concurrency: ReleaseConcurrencyConfig,

    /// PostgreSQL persistence
    pub database: DatabaseConfig,

    /// Event bus
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunQueueConfig {
    /// Environment concurrency used when no explicit limit was stored
    pub default_env_concurrency: u32,
    /// Prefix prepended to every key the queue writes
    pub key_prefix: String,
    /// How many master-queue entries a dequeue considers at once
    pub candidate_limit: usize,
    /// Nacks allowed before a message is dead-lettered
    pub max_nack_attempts: u32,
    /// Redis connection string when the Redis backend is enabled
    pub redis_url: Option<String>,
}

impl Default for RunQueueConfig {
    fn default() -> Self {
        Self {
            default_env_concurrency: DEFAULT_ENVIRONMENT_CONCURRENCY,
            key_prefix: "runqueue:".to_string(),
            candidate_limit: 24,
            max_nack_attempts: 50,
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunLockConfig {
    pub timeout_ms: u64,
    /// Expiry of a Redis lock key; extended while the holder is alive
    pub lock_ttl_ms: u64,
    pub retry_delay_ms: u64,
    pub redis_url: Option<String>,
}

impl Default for RunLockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_RUN_LOCK_TIMEOUT_MS,
            lock_ttl_ms: 10_000,
            retry_delay_ms: 25,
            redis_url: None,
        }
    }
}

impl RunLockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries with a delay above this are nacked back into the queue
    pub warm_start_threshold_ms: u64,
    /// Policy used for engine-detected failures (stalls, heartbeats)
    pub default_options: RetryOptions,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            warm_start_threshold_ms: DEFAULT_RETRY_WARM_START_THRESHOLD_MS,
            default_options: RetryOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub pending_executing_ms: u64,
    pub executing_ms: u64,
    pub executing_with_waitpoints_ms: u64,
    pub pending_cancel_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pending_executing_ms: 60_000,
            executing_ms: 60_000,
            executing_with_waitpoints_ms: 60_000,
            pending_cancel_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MachinesConfig {
    pub default_machine: String,
    pub presets: HashMap<String, MachinePreset>,
}

impl Default for MachinesConfig {
    fn default() -> Self {
        let presets = [
            MachinePreset::new("micro", 0.25, 0.25, 0.000_008_5),
            MachinePreset::new("small-1x", 0.5, 0.5, 0.000_017),
            MachinePreset::new("small-2x", 1.0, 1.0, 0.000_034),
            MachinePreset::new("medium-1x", 1.0, 2.0, 0.000_068),
            MachinePreset::new("medium-2x", 2.0, 4.0, 0.000_136),
            MachinePreset::new("large-1x", 4.0, 8.0, 0.000_272),
            MachinePreset::new("large-2x", 8.0, 16.0, 0.000_544),
        ]
        .into_iter()
        .map(|preset| (preset.name.clone(), preset))
        .collect();

        Self {
            default_machine: "small-1x".to_string(),
            presets,
        }
    }
}

impl MachinesConfig {
    /// Resolve a preset by name, falling back to the default machine.
    pub fn resolve(&self, name: Option<&str>) -> MachinePreset {
        name.and_then(|n| self.presets.get(n))
            .or_else(|| self.presets.get(&self.default_machine))
            .cloned()
            .unwrap_or_else(|| MachinePreset::new(&self.default_machine, 0.5, 0.5, 0.0))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub concurrency: usize,
    pub batch_size: usize,
    pub max_job_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 100,
            concurrency: 10,
            batch_size: 25,
            max_job_attempts: 10,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// What happens to a batch in which no item produced a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchZeroSuccessPolicy {
    /// Mark the batch ABORTED and resume the parent with an error
    #[default]
    Abort,
    /// Mark the batch COMPLETED with an empty result set
    Complete,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub zero_success_policy: BatchZeroSuccessPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Longest a debounced run may keep being pushed back after creation
    pub max_window_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            max_window_ms: 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReleaseConcurrencyConfig {
    pub release_env_on_waitpoint: bool,
    pub release_queue_on_waitpoint: bool,
}

impl Default for ReleaseConcurrencyConfig {
    fn default() -> Self {
        Self {
            release_env_on_waitpoint: true,
            release_queue_on_waitpoint: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_seconds: 10,
        }
    }
}

impl DatabaseConfig {
    /// Explicit URL, else `DATABASE_URL`.
    pub fn database_url(&self) -> Option<String> {
        self.url
            .clone()
            .filter(|url| !url.is_empty())
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.queue.default_env_concurrency == 0 {
            return Err(EngineError::Configuration(
                "queue.default_env_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.queue.candidate_limit == 0 {
            return Err(EngineError::Configuration(
                "queue.candidate_limit must be greater than zero".to_string(),
            ));
        }
        if self.run_lock.timeout_ms == 0 {
            return Err(EngineError::Configuration(
                "run_lock.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.run_lock.lock_ttl_ms < self.run_lock.retry_delay_ms {
            return Err(EngineError::Configuration(
                "run_lock.lock_ttl_ms must be at least run_lock.retry_delay_ms".to_string(),
            ));
        }
        if self.retry.default_options.max_attempts > MAX_TASK_RUN_ATTEMPTS {
            return Err(EngineError::Configuration(format!(
                "retry.default_options.max_attempts cannot exceed {MAX_TASK_RUN_ATTEMPTS}"
            )));
        }
        if !self.machines.presets.contains_key(&self.machines.default_machine) {
            return Err(EngineError::Configuration(format!(
                "machines.default_machine '{}' has no preset",
                self.machines.default_machine
            )));
        }
        if self.worker.concurrency == 0 || self.worker.batch_size == 0 {
            return Err(EngineError::Configuration(
                "worker.concurrency and worker.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(EngineError::Configuration(
                "events.channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.warm_start_threshold_ms, 30_000);
        assert_eq!(config.batch.zero_success_policy, BatchZeroSuccessPolicy::Abort);
    }

    #[test]
    fn test_unknown_default_machine_rejected() {
        let mut config = EngineConfig::default();
        config.machines.default_machine = "gigantic".to_string();
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_machine_resolution_falls_back_to_default() {
        let machines = MachinesConfig::default();
        assert_eq!(machines.resolve(Some("large-1x")).name, "large-1x");
        assert_eq!(machines.resolve(Some("nope")).name, "small-1x");
        assert_eq!(machines.resolve(None).name, "small-1x");
    }
}
