use proptest::prelude::*;
use run_engine::models::{TaskRunError, TaskRunErrorCode};
use run_engine::retry::RetryOptions;

/// Task identifiers as they appear in trigger requests
pub fn task_identifier_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,30}"
}

/// Retry policies with sane bounds
pub fn retry_options_strategy() -> impl Strategy<Value = RetryOptions> {
    (1u32..20, 1.0f64..4.0, 1u64..5_000, 0u64..120_000, any::<bool>()).prop_map(
        |(max_attempts, factor, min_timeout_ms, extra, randomize)| RetryOptions {
            max_attempts,
            factor,
            min_timeout_ms,
            max_timeout_ms: min_timeout_ms + extra,
            randomize,
            out_of_memory_machine: None,
        },
    )
}

pub fn internal_error_code_strategy() -> impl Strategy<Value = TaskRunErrorCode> {
    prop_oneof![
        Just(TaskRunErrorCode::TaskRunCancelled),
        Just(TaskRunErrorCode::MaxDurationExceeded),
        Just(TaskRunErrorCode::TaskProcessOomKilled),
        Just(TaskRunErrorCode::TaskProcessExitedWithNonZeroCode),
        Just(TaskRunErrorCode::TaskRunHeartbeatTimeout),
        Just(TaskRunErrorCode::TaskRunStalledExecuting),
        Just(TaskRunErrorCode::TaskRunDequeuedMaxRetries),
        Just(TaskRunErrorCode::TaskRunCrashed),
        Just(TaskRunErrorCode::MaxAttemptsExceeded),
        Just(TaskRunErrorCode::CouldNotFindTask),
        Just(TaskRunErrorCode::TaskInputError),
        Just(TaskRunErrorCode::TaskOutputError),
        Just(TaskRunErrorCode::RecursiveWaitDeadlock),
    ]
}

/// Errors reported by a worker, including oversized and NUL-laden text
pub fn task_run_error_strategy() -> impl Strategy<Value = TaskRunError> {
    prop_oneof![
        ("[A-Za-z]{1,20}", ".{0,200}", proptest::option::of(".{0,20000}")).prop_map(
            |(name, message, stack_trace)| TaskRunError::BuiltInError {
                name,
                message,
                stack_trace,
            }
        ),
        ".{0,20000}".prop_map(|raw| TaskRunError::StringError { raw }),
        ".{0,200}".prop_map(|raw| TaskRunError::CustomError { raw }),
        (internal_error_code_strategy(), proptest::option::of(".{0,200}")).prop_map(
            |(code, message)| TaskRunError::InternalError {
                code,
                message,
                stack_trace: None,
            }
        ),
    ]
}
