mod common;

use common::strategies::*;
use proptest::prelude::*;
use run_engine::engine::TriggerRequest;
use run_engine::retry::sanitize_error;
use run_engine::models::TaskRunError;
use serde_json::json;

proptest! {
    /// Property: backoff never leaves the [min, max] window of its policy
    #[test]
    fn backoff_stays_within_bounds(options in retry_options_strategy(), attempt in 1u32..60) {
        let delay = options.delay_for_attempt(attempt);
        prop_assert!(delay >= options.min_timeout_ms.min(options.max_timeout_ms));
        prop_assert!(delay <= options.max_timeout_ms.max(options.min_timeout_ms));
    }

    /// Property: backoff without jitter never shrinks as attempts grow
    #[test]
    fn backoff_is_monotonic_without_jitter(options in retry_options_strategy(), attempt in 1u32..40) {
        let options = run_engine::retry::RetryOptions { randomize: false, ..options };
        prop_assert!(options.delay_for_attempt(attempt) <= options.delay_for_attempt(attempt + 1));
    }

    /// Property: sanitized errors are storable and keep their variant
    #[test]
    fn sanitized_errors_have_no_nul_and_bounded_fields(error in task_run_error_strategy()) {
        let sanitized = sanitize_error(&error);
        let fields: Vec<String> = match &sanitized {
            TaskRunError::BuiltInError { name, message, stack_trace } => {
                let mut fields = vec![name.clone(), message.clone()];
                fields.extend(stack_trace.clone());
                fields
            }
            TaskRunError::CustomError { raw } | TaskRunError::StringError { raw } => vec![raw.clone()],
            TaskRunError::InternalError { message, stack_trace, code } => {
                prop_assert_eq!(Some(*code), error.internal_code());
                message.iter().chain(stack_trace.iter()).cloned().collect()
            }
        };
        for field in fields {
            prop_assert!(!field.contains('\0'));
            prop_assert!(field.chars().count() <= 10_000);
        }
        prop_assert_eq!(
            std::mem::discriminant(&sanitized),
            std::mem::discriminant(&error)
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: an environment limit caps how many runs a dequeue hands out
    #[test]
    fn environment_limit_caps_dequeue(
        run_count in 1usize..8,
        limit in 1u32..5,
        task in task_identifier_strategy(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let engine = common::engine();
            let env = common::environment().with_concurrency_limit(limit);
            let mut master_queue = String::new();
            for i in 0..run_count {
                let run = engine
                    .trigger(TriggerRequest::new(env.clone(), task.clone(), json!({"i": i})))
                    .await
                    .unwrap();
                master_queue = run.master_queue;
            }

            let dequeued = engine
                .dequeue_from_master_queue(common::WORKER_ID, &master_queue, 50)
                .await
                .unwrap();
            let expected = run_count.min(limit as usize);
            assert_eq!(dequeued.len(), expected);
            assert_eq!(
                engine.run_queue().current_concurrency_of_environment(&env).await.unwrap(),
                expected as u64
            );
        });
    }
}
