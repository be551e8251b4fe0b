//! # System Constants
//!
//! Operational boundaries of the run engine: attempt ceilings, key-format
//! markers shared by the queue scripts, scheduled-job id prefixes and the
//! fallbacks used when configuration omits a value.

/// Hard ceiling on attempts for any run, regardless of its retry options.
pub const MAX_TASK_RUN_ATTEMPTS: u32 = 250;

/// Default maximum number of runs an environment may execute at once.
pub const DEFAULT_ENVIRONMENT_CONCURRENCY: u32 = 100;

/// Retries whose delay is at or below this run warm, without a queue round trip.
pub const DEFAULT_RETRY_WARM_START_THRESHOLD_MS: u64 = 30_000;

/// Default time budget for acquiring a run lock.
pub const DEFAULT_RUN_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Claimed jobs become due again if not settled within this window.
pub const JOB_VISIBILITY_TIMEOUT_MS: u64 = 60_000;

/// Master queue used when a trigger does not name a worker pool.
pub const DEFAULT_MASTER_QUEUE: &str = "main";

/// Payload type recorded for JSON payloads and outputs.
pub const JSON_OUTPUT_TYPE: &str = "application/json";

/// Markers used by [`crate::run_queue::KeyProducer`] when building and
/// parsing store keys. The queue scripts rely on these exact strings.
pub mod keys {
    pub const ORG_PART: &str = "org";
    pub const PROJECT_PART: &str = "proj";
    pub const ENV_PART: &str = "env";
    pub const QUEUE_PART: &str = "queue";
    pub const CONCURRENCY_KEY_PART: &str = "ck";
    pub const TASK_PART: &str = "task";
    pub const MESSAGE_PART: &str = "message";
    pub const CURRENT_CONCURRENCY_PART: &str = "currentConcurrency";
    pub const CONCURRENCY_LIMIT_PART: &str = "concurrency";
    pub const MASTER_QUEUE_PART: &str = "masterQueue";
    pub const DEAD_LETTER_PART: &str = "deadLetter";
    pub const JOBS_PART: &str = "jobs";
    pub const LOCK_PART: &str = "lock";
}

/// Stable job id prefixes; one outstanding job per (prefix, subject).
pub mod jobs {
    pub const CONTINUE_RUN_IF_UNBLOCKED: &str = "continueRunIfUnblocked";
    pub const CANCEL_RUN: &str = "cancelRun";
    pub const TRY_COMPLETE_BATCH: &str = "tryCompleteBatch";
    pub const ENQUEUE_DELAYED_RUN: &str = "enqueueDelayedRun";
    pub const EXPIRE_RUN: &str = "expireRun";
    pub const HEARTBEAT_SNAPSHOT: &str = "heartbeatSnapshot";
    pub const FINISH_WAITPOINT: &str = "finishWaitpoint";
}

/// Domain event names as they appear on the event bus.
pub mod events {
    pub const RUN_ATTEMPT_STARTED: &str = "runAttemptStarted";
    pub const RUN_SUCCEEDED: &str = "runSucceeded";
    pub const RUN_FAILED: &str = "runFailed";
    pub const RUN_CANCELLED: &str = "runCancelled";
    pub const RUN_RETRY_SCHEDULED: &str = "runRetryScheduled";
    pub const RUN_EXPIRED: &str = "runExpired";
    pub const RUN_DELAY_RESCHEDULED: &str = "runDelayRescheduled";
    pub const EXECUTION_SNAPSHOT_CREATED: &str = "executionSnapshotCreated";
    pub const RUN_METADATA_UPDATED: &str = "runMetadataUpdated";
    pub const WORKER_NOTIFICATION: &str = "workerNotification";
}
