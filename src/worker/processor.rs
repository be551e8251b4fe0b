//! Background processing of due engine jobs.

use super::job::EngineJob;
use super::scheduler::{ClaimedJob, JobScheduler};
use crate::config::WorkerConfig;
use crate::error::{EngineError, EngineResult};
use crate::retry::RetryOptions;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Executes one engine job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle_job(&self, job: &EngineJob) -> anyhow::Result<()>;
}

/// Counts from one pass over the due jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessJobsResult {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub abandoned: usize,
}

/// Polls the job scheduler and runs due jobs with bounded concurrency.
///
/// Holds its handler weakly so the engine that owns the worker can be
/// dropped while the loop is still running.
pub struct EngineWorker {
    scheduler: JobScheduler,
    handler: Weak<dyn JobHandler>,
    config: WorkerConfig,
    backoff: RetryOptions,
    running: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EngineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineWorker")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Acquire))
            .finish()
    }
}

impl EngineWorker {
    pub fn new(scheduler: JobScheduler, handler: Weak<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            scheduler,
            handler,
            config,
            backoff: RetryOptions {
                max_attempts: u32::MAX,
                factor: 2.0,
                min_timeout_ms: 500,
                max_timeout_ms: 30_000,
                randomize: true,
                out_of_memory_machine: None,
            },
            running: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim and run every due job once.
    pub async fn process_due_jobs(&self) -> EngineResult<ProcessJobsResult> {
        let Some(handler) = self.handler.upgrade() else {
            return Err(EngineError::Internal(
                "Job handler dropped while worker still active".to_string(),
            ));
        };

        let claimed = self
            .scheduler
            .claim_due(Utc::now(), self.config.batch_size)
            .await?;
        let mut result = ProcessJobsResult {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(result);
        }

        let outcomes: Vec<EngineResult<JobOutcome>> = futures::stream::iter(claimed)
            .map(|job| {
                let handler = handler.clone();
                async move { self.run_job(handler.as_ref(), job).await }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome? {
                JobOutcome::Succeeded => result.succeeded += 1,
                JobOutcome::Retried => result.retried += 1,
                JobOutcome::Abandoned => result.abandoned += 1,
            }
        }
        Ok(result)
    }

    async fn run_job(&self, handler: &dyn JobHandler, claimed: ClaimedJob) -> EngineResult<JobOutcome> {
        let job_id = claimed.scheduled.id.clone();
        match handler.handle_job(claimed.job()).await {
            Ok(()) => {
                self.scheduler.complete(&claimed).await?;
                debug!(job_id = %job_id, "Job completed");
                Ok(JobOutcome::Succeeded)
            }
            Err(e) if claimed.scheduled.attempt + 1 < self.config.max_job_attempts => {
                let delay = self.backoff.delay_for_attempt(claimed.scheduled.attempt + 1);
                let run_at = Utc::now() + chrono::Duration::milliseconds(delay as i64);
                warn!(
                    job_id = %job_id,
                    attempt = claimed.scheduled.attempt + 1,
                    retry_in_ms = delay,
                    error = %e,
                    "Job failed, retrying"
                );
                self.scheduler.retry(&claimed, run_at).await?;
                Ok(JobOutcome::Retried)
            }
            Err(e) => {
                error!(
                    job_id = %job_id,
                    attempts = claimed.scheduled.attempt + 1,
                    error = %e,
                    "Job failed permanently, dropping it"
                );
                self.scheduler.complete(&claimed).await?;
                Ok(JobOutcome::Abandoned)
            }
        }
    }

    /// Spawn the polling loop.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Internal("Engine worker is already running".to_string()));
        }

        let worker = Arc::downgrade(self);
        let running = self.running.clone();
        let shutdown_notify = self.shutdown_notify.clone();
        let poll_interval = self.config.poll_interval();

        let handle = tokio::spawn(async move {
            info!(poll_interval_ms = poll_interval.as_millis() as u64, "Engine worker started");
            while running.load(Ordering::Acquire) {
                let Some(worker) = worker.upgrade() else {
                    break;
                };
                if let Err(e) = worker.process_due_jobs().await {
                    error!(error = %e, "Failed to process due jobs");
                }
                drop(worker);

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown_notify.notified() => break,
                }
            }
            running.store(false, Ordering::Release);
            info!("Engine worker stopped");
        });

        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the polling loop and wait for the in-flight pass to finish.
    pub async fn quit(&self, timeout: Duration) -> EngineResult<()> {
        self.running.store(false, Ordering::Release);
        self.shutdown_notify.notify_waiters();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("Engine worker did not stop within {:?}", timeout);
            }
        }
        Ok(())
    }
}

enum JobOutcome {
    Succeeded,
    Retried,
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_queue::{KeyProducer, QueueBackend};
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle_job(&self, _job: &EngineJob) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("handler failure");
            }
            Ok(())
        }
    }

    fn setup(fail: bool, max_job_attempts: u32) -> (Arc<CountingHandler>, EngineWorker, JobScheduler) {
        let scheduler = JobScheduler::new(
            QueueBackend::memory(),
            KeyProducer::new("test:"),
            Duration::from_secs(30),
        );
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail,
        });
        let weak: Weak<dyn JobHandler> = Arc::downgrade(&(handler.clone() as Arc<dyn JobHandler>));
        let worker = EngineWorker::new(
            scheduler.clone(),
            weak,
            WorkerConfig {
                max_job_attempts,
                ..WorkerConfig::default()
            },
        );
        (handler, worker, scheduler)
    }

    #[tokio::test]
    async fn test_successful_jobs_are_removed() {
        let (handler, worker, scheduler) = setup(false, 3);
        for _ in 0..3 {
            scheduler
                .schedule(EngineJob::ExpireRun { run_id: Uuid::now_v7() }, Utc::now())
                .await
                .unwrap();
        }

        let result = worker.process_due_jobs().await.unwrap();
        assert_eq!(result.claimed, 3);
        assert_eq!(result.succeeded, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(scheduler.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_is_abandoned_after_max_attempts() {
        let (_handler, worker, scheduler) = setup(true, 1);
        scheduler
            .schedule(EngineJob::ExpireRun { run_id: Uuid::now_v7() }, Utc::now())
            .await
            .unwrap();

        let result = worker.process_due_jobs().await.unwrap();
        assert_eq!(result.abandoned, 1);
        assert!(scheduler.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_is_retried_later() {
        let (_handler, worker, scheduler) = setup(true, 5);
        scheduler
            .schedule(EngineJob::ExpireRun { run_id: Uuid::now_v7() }, Utc::now())
            .await
            .unwrap();

        let result = worker.process_due_jobs().await.unwrap();
        assert_eq!(result.retried, 1);
        let pending = scheduler.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].1 > Utc::now().timestamp_millis());
    }

    #[tokio::test]
    async fn test_start_and_quit() {
        let (handler, worker, scheduler) = setup(false, 3);
        let worker = Arc::new(worker);
        scheduler
            .schedule(EngineJob::ExpireRun { run_id: Uuid::now_v7() }, Utc::now())
            .await
            .unwrap();

        worker.start().await.unwrap();
        assert!(worker.start().await.is_err());
        tokio::time::sleep(Duration::from_millis(250)).await;
        worker.quit(Duration::from_secs(1)).await.unwrap();

        assert!(!worker.is_running());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
