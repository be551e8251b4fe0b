//! Error types for the run engine.
//!
//! Validation failures carry enough context to be surfaced to callers with an
//! HTTP-like status (see [`EngineError::status_code`]). Infrastructure
//! failures are logged by the layer that observed them and then propagated.
//! Failures of the executed work itself are never errors here; they travel as
//! [`crate::models::TaskRunError`] data inside a completion.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: Uuid },

    #[error("No execution snapshot found for run {run_id}")]
    SnapshotNotFound { run_id: Uuid },

    #[error("Snapshot {supplied} is not the latest snapshot for run {run_id} (latest is {latest})")]
    SnapshotConflict {
        run_id: Uuid,
        supplied: Uuid,
        latest: Uuid,
    },

    #[error("Waitpoint {waitpoint_id} not found")]
    WaitpointNotFound { waitpoint_id: Uuid },

    #[error("Batch {batch_id} not found")]
    BatchNotFound { batch_id: Uuid },

    #[error("Queue {queue} not found")]
    QueueNotFound { queue: String },

    #[error("Run {run_id} is already canceled")]
    RunAlreadyCanceled { run_id: Uuid },

    #[error("Run {run_id} is in state {state} which does not allow {operation}")]
    InvalidState {
        run_id: Uuid,
        state: String,
        operation: String,
    },

    #[error("Run {run_id} already used all {max_attempts} attempts")]
    MaxAttemptsReached { run_id: Uuid, max_attempts: u32 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timed out after {timeout_ms}ms acquiring lock for {operation} on {resources:?}")]
    LockTimeout {
        operation: String,
        resources: Vec<String>,
        timeout_ms: u64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// HTTP-like status code for the presentation layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RunNotFound { .. }
            | Self::SnapshotNotFound { .. }
            | Self::WaitpointNotFound { .. }
            | Self::BatchNotFound { .. }
            | Self::QueueNotFound { .. } => 404,
            Self::SnapshotConflict { .. } => 409,
            Self::RunAlreadyCanceled { .. }
            | Self::InvalidState { .. }
            | Self::MaxAttemptsReached { .. } => 422,
            Self::InvalidInput(_) => 400,
            Self::LockTimeout { .. } => 503,
            Self::Database(_)
            | Self::Queue(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Validation errors are the caller's fault and must not be retried blindly.
    pub fn is_validation_error(&self) -> bool {
        self.status_code() < 500
    }

    /// Infrastructure errors the caller may retry as a whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::Database(_) | Self::Queue(_)
        )
    }

    pub fn snapshot_conflict(run_id: Uuid, supplied: Uuid, latest: Uuid) -> Self {
        Self::SnapshotConflict {
            run_id,
            supplied,
            latest,
        }
    }

    pub fn invalid_state(
        run_id: Uuid,
        state: impl ToString,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            run_id,
            state: state.to_string(),
            operation: operation.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization(format!("JSON serialization error: {error}"))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Database(format!("Migration failed: {err}"))
    }
}

#[cfg(any(feature = "redis-queue", feature = "redis-lock"))]
impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::Queue(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_conflict_is_409() {
        let err = EngineError::snapshot_conflict(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        assert_eq!(err.status_code(), 409);
        assert!(err.is_validation_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_infrastructure_errors_are_retryable() {
        let err = EngineError::LockTimeout {
            operation: "startRunAttempt".to_string(),
            resources: vec!["run".to_string()],
            timeout_ms: 10,
        };
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), 503);
        assert!(!EngineError::Internal("boom".into()).is_retryable());
    }
}
