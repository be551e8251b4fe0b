//! # Scheduled Engine Jobs
//!
//! Deferred work (expiring runs, heartbeats, delayed enqueues, batch
//! completion, cancellation fan-out) is stored as future-scored jobs in the
//! queue backend rather than as in-process timers, so it survives restarts.

pub mod job;
pub mod processor;
pub mod scheduler;

pub use job::{job_id, EngineJob, JobAction, ScheduledJob};
pub use processor::{EngineWorker, JobHandler, ProcessJobsResult};
pub use scheduler::{ClaimedJob, JobScheduler};
