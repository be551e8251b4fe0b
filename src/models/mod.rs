//! Data model of the engine: runs, their snapshot chain, waitpoints, batches
//! and the descriptors exchanged with workers.

pub mod batch;
pub mod completion;
pub mod environment;
pub mod execution;
pub mod run;
pub mod snapshot;
pub mod waitpoint;

pub use batch::{BatchItemOutcome, BatchTaskRun, BatchTaskRunItem, BatchTaskRunStatus, BatchUpdate};
pub use completion::{
    CancelRunRequest, TaskRunError, TaskRunErrorCode, TaskRunExecutionResult,
    TaskRunExecutionRetry, WorkerIdentity,
};
pub use environment::{AuthenticatedEnvironment, MachinePreset, RuntimeEnvironmentType};
pub use execution::{
    AttemptInfo, AttemptStatus, BatchInfo, CompleteRunAttemptResult, DequeuedMessage,
    EnvironmentInfo, ExecutionResult, QueueInfo, RunExecutionData, RunInfo, StartRunAttemptResult,
    TaskInfo, TaskRunExecution,
};
pub use run::{RunUpdate, TaskRun, TaskRunStatus};
pub use snapshot::{CompletedWaitpointRef, ExecutionSnapshot, TaskRunExecutionStatus};
pub use waitpoint::{
    BlockingWaitpoint, CompletedWaitpoint, TaskRunWaitpoint, Waitpoint, WaitpointOutput,
    WaitpointStatus, WaitpointType,
};

use uuid::Uuid;

/// Human-facing id: `<prefix>_` followed by 21 lowercase alphanumerics.
pub fn generate_friendly_id(prefix: &str) -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &simple[..21])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friendly_id_shape() {
        let id = generate_friendly_id("run");
        assert!(id.starts_with("run_"));
        assert_eq!(id.len(), 4 + 21);
        assert_ne!(id, generate_friendly_id("run"));
    }
}
