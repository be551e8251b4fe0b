//! Frees a blocked run's concurrency slots so other runs can use them while
//! it waits, and takes them back when it resumes.

use super::resources::SystemResources;
use crate::error::EngineResult;
use crate::models::TaskRun;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct ReleaseConcurrencySystem {
    resources: Arc<SystemResources>,
}

impl ReleaseConcurrencySystem {
    pub fn new(resources: Arc<SystemResources>) -> Self {
        Self { resources }
    }

    /// Returns whether any slot was released.
    pub async fn release_for_waitpoint(&self, run: &TaskRun) -> EngineResult<bool> {
        let policy = &self.resources.config.release_concurrency;
        if !policy.release_env_on_waitpoint {
            return Ok(false);
        }
        let released = self
            .resources
            .run_queue
            .release_concurrency(run.organization_id, run.id, policy.release_queue_on_waitpoint)
            .await?;
        debug!(
            run_id = %run.id,
            released,
            release_queue = policy.release_queue_on_waitpoint,
            "Released concurrency for blocked run"
        );
        Ok(released)
    }

    pub async fn reacquire_for_resume(&self, run: &TaskRun) -> EngineResult<bool> {
        if !self.resources.config.release_concurrency.release_env_on_waitpoint {
            return Ok(false);
        }
        let reacquired = self
            .resources
            .run_queue
            .reacquire_concurrency(run.organization_id, run.id)
            .await?;
        debug!(run_id = %run.id, reacquired, "Reacquired concurrency for resumed run");
        Ok(reacquired)
    }
}
