use crate::models::{AuthenticatedEnvironment, RuntimeEnvironmentType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::keys::QueueDescriptor;

/// Payload stored for every queued run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub run_id: Uuid,
    pub task_identifier: String,
    pub organization_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub environment_type: RuntimeEnvironmentType,
    pub queue: String,
    pub concurrency_key: Option<String>,
    /// Score in the queue's sorted set, in epoch milliseconds
    pub timestamp: i64,
    /// Times this message has been nacked
    pub attempt: u32,
    pub master_queue: String,
}

impl QueueMessage {
    pub fn descriptor(&self) -> QueueDescriptor {
        QueueDescriptor {
            organization_id: self.organization_id,
            project_id: self.project_id,
            environment_id: self.environment_id,
            queue: self.queue.clone(),
            concurrency_key: self.concurrency_key.clone(),
        }
    }

    pub fn environment(&self) -> AuthenticatedEnvironment {
        AuthenticatedEnvironment {
            id: self.environment_id,
            env_type: self.environment_type,
            project_id: self.project_id,
            organization_id: self.organization_id,
            maximum_concurrency_limit: None,
        }
    }
}

/// A message handed out by a dequeue.
#[derive(Debug, Clone, PartialEq)]
pub struct DequeuedQueueMessage {
    pub message_id: Uuid,
    pub message: QueueMessage,
}
