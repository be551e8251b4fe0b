//! Key layout of the run queue.
//!
//! ```text
//! {org:O}:proj:P:env:E:queue:Q[:ck:K]            sorted set of run ids
//! {org:O}:proj:P:env:E:queue:Q[:ck:K]:currentConcurrency
//! {org:O}:proj:P:env:E:queue:Q:concurrency       queue limit
//! {org:O}:proj:P:env:E:currentConcurrency
//! {org:O}:proj:P:env:E:concurrency               environment limit
//! {org:O}:proj:P:currentConcurrency
//! {org:O}:proj:P:env:E:task:T:currentConcurrency
//! {org:O}:message:RUN                            message payload
//! masterQueue:NAME                               queue key -> earliest score
//! ```
//!
//! Every key is prefixed with the configured key prefix.

use crate::constants::keys::*;
use crate::models::AuthenticatedEnvironment;
use uuid::Uuid;

/// The parts a queue key was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub organization_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub queue: String,
    pub concurrency_key: Option<String>,
}

/// Pure mapping from identifiers to store keys.
#[derive(Debug, Clone)]
pub struct KeyProducer {
    prefix: String,
}

impl KeyProducer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn env_base(&self, org: Uuid, project: Uuid, env: Uuid) -> String {
        format!(
            "{}{{{ORG_PART}:{org}}}:{PROJECT_PART}:{project}:{ENV_PART}:{env}",
            self.prefix
        )
    }

    fn project_base(&self, org: Uuid, project: Uuid) -> String {
        format!("{}{{{ORG_PART}:{org}}}:{PROJECT_PART}:{project}", self.prefix)
    }

    pub fn queue_key(
        &self,
        env: &AuthenticatedEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> String {
        self.queue_key_from_descriptor(&QueueDescriptor {
            organization_id: env.organization_id,
            project_id: env.project_id,
            environment_id: env.id,
            queue: queue.to_string(),
            concurrency_key: concurrency_key.map(str::to_string),
        })
    }

    pub fn queue_key_from_descriptor(&self, descriptor: &QueueDescriptor) -> String {
        let base = format!(
            "{}:{QUEUE_PART}:{}",
            self.env_base(
                descriptor.organization_id,
                descriptor.project_id,
                descriptor.environment_id
            ),
            descriptor.queue
        );
        match &descriptor.concurrency_key {
            Some(key) => format!("{base}:{CONCURRENCY_KEY_PART}:{key}"),
            None => base,
        }
    }

    /// Queue names end at the concurrency-key marker, so they may not
    /// contain it. Concurrency keys themselves are unrestricted.
    pub fn is_valid_queue_name(queue: &str) -> bool {
        !queue.is_empty() && !queue.contains(&format!(":{CONCURRENCY_KEY_PART}:"))
    }

    /// Parse a key produced by [`KeyProducer::queue_key`].
    pub fn parse_queue_key(&self, key: &str) -> Option<QueueDescriptor> {
        let rest = key.strip_prefix(&self.prefix)?;
        let rest = rest.strip_prefix(&format!("{{{ORG_PART}:"))?;
        let (org, rest) = rest.split_once("}:")?;
        let rest = rest.strip_prefix(&format!("{PROJECT_PART}:"))?;
        let (project, rest) = rest.split_once(':')?;
        let rest = rest.strip_prefix(&format!("{ENV_PART}:"))?;
        let (env, rest) = rest.split_once(':')?;
        let rest = rest.strip_prefix(&format!("{QUEUE_PART}:"))?;

        let ck_marker = format!(":{CONCURRENCY_KEY_PART}:");
        let (queue, concurrency_key) = match rest.find(&ck_marker) {
            Some(index) => (
                &rest[..index],
                Some(rest[index + ck_marker.len()..].to_string()),
            ),
            None => (rest, None),
        };
        if queue.is_empty() {
            return None;
        }

        Some(QueueDescriptor {
            organization_id: org.parse().ok()?,
            project_id: project.parse().ok()?,
            environment_id: env.parse().ok()?,
            queue: queue.to_string(),
            concurrency_key,
        })
    }

    pub fn queue_current_concurrency_key(&self, descriptor: &QueueDescriptor) -> String {
        format!(
            "{}:{CURRENT_CONCURRENCY_PART}",
            self.queue_key_from_descriptor(descriptor)
        )
    }

    /// Limits are set per queue, shared by all of its concurrency keys.
    pub fn queue_concurrency_limit_key(&self, descriptor: &QueueDescriptor) -> String {
        let without_ck = QueueDescriptor {
            concurrency_key: None,
            ..descriptor.clone()
        };
        format!(
            "{}:{CONCURRENCY_LIMIT_PART}",
            self.queue_key_from_descriptor(&without_ck)
        )
    }

    pub fn env_current_concurrency_key(&self, org: Uuid, project: Uuid, env: Uuid) -> String {
        format!(
            "{}:{CURRENT_CONCURRENCY_PART}",
            self.env_base(org, project, env)
        )
    }

    pub fn env_concurrency_limit_key(&self, org: Uuid, project: Uuid, env: Uuid) -> String {
        format!("{}:{CONCURRENCY_LIMIT_PART}", self.env_base(org, project, env))
    }

    pub fn project_current_concurrency_key(&self, org: Uuid, project: Uuid) -> String {
        format!(
            "{}:{CURRENT_CONCURRENCY_PART}",
            self.project_base(org, project)
        )
    }

    /// Prefix completed with `<task>:currentConcurrency` inside the dequeue
    /// script, once the popped message reveals its task.
    pub fn task_current_concurrency_key_prefix(&self, org: Uuid, project: Uuid, env: Uuid) -> String {
        format!("{}:{TASK_PART}:", self.env_base(org, project, env))
    }

    pub fn task_current_concurrency_key(
        &self,
        org: Uuid,
        project: Uuid,
        env: Uuid,
        task_identifier: &str,
    ) -> String {
        format!(
            "{}{task_identifier}:{CURRENT_CONCURRENCY_PART}",
            self.task_current_concurrency_key_prefix(org, project, env)
        )
    }

    pub fn message_key_prefix(&self, org: Uuid) -> String {
        format!("{}{{{ORG_PART}:{org}}}:{MESSAGE_PART}:", self.prefix)
    }

    pub fn message_key(&self, org: Uuid, run_id: Uuid) -> String {
        format!("{}{run_id}", self.message_key_prefix(org))
    }

    pub fn master_queue_key(&self, master_queue: &str) -> String {
        format!("{}{MASTER_QUEUE_PART}:{master_queue}", self.prefix)
    }

    pub fn dead_letter_key(&self, org: Uuid, project: Uuid, env: Uuid) -> String {
        format!("{}:{DEAD_LETTER_PART}", self.env_base(org, project, env))
    }

    /// Sorted set of scheduled engine jobs.
    pub fn jobs_key(&self) -> String {
        format!("{}{JOBS_PART}", self.prefix)
    }

    pub fn job_payload_key(&self, job_id: &str) -> String {
        format!("{}{JOBS_PART}:{job_id}", self.prefix)
    }

    pub fn lock_key(&self, resource: &str) -> String {
        format!("{}{LOCK_PART}:{resource}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuntimeEnvironmentType;
    use proptest::prelude::*;

    fn producer() -> KeyProducer {
        KeyProducer::new("test:")
    }

    #[test]
    fn test_queue_key_shape() {
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Development);
        let key = producer().queue_key(&env, "task/my-task", Some("user-1"));
        assert_eq!(
            key,
            format!(
                "test:{{org:{}}}:proj:{}:env:{}:queue:task/my-task:ck:user-1",
                env.organization_id, env.project_id, env.id
            )
        );
    }

    #[test]
    fn test_limit_key_ignores_concurrency_key() {
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let keys = producer();
        let with_ck = keys.parse_queue_key(&keys.queue_key(&env, "q", Some("a"))).unwrap();
        let without_ck = keys.parse_queue_key(&keys.queue_key(&env, "q", None)).unwrap();
        assert_eq!(
            keys.queue_concurrency_limit_key(&with_ck),
            keys.queue_concurrency_limit_key(&without_ck)
        );
        assert_ne!(
            keys.queue_current_concurrency_key(&with_ck),
            keys.queue_current_concurrency_key(&without_ck)
        );
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        let keys = producer();
        assert!(keys.parse_queue_key("other:{org:x}:proj:y").is_none());
        assert!(keys.parse_queue_key("test:masterQueue:main").is_none());
    }

    #[test]
    fn test_concurrency_key_may_contain_marker() {
        let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
        let keys = producer();
        let parsed = keys
            .parse_queue_key(&keys.queue_key(&env, "emails", Some("tenant:ck:7")))
            .unwrap();
        assert_eq!(parsed.queue, "emails");
        assert_eq!(parsed.concurrency_key.as_deref(), Some("tenant:ck:7"));
    }

    #[test]
    fn test_queue_name_validation() {
        assert!(KeyProducer::is_valid_queue_name("task/my-task"));
        assert!(KeyProducer::is_valid_queue_name("a:ck"));
        assert!(!KeyProducer::is_valid_queue_name("a:ck:b"));
        assert!(!KeyProducer::is_valid_queue_name(""));
    }

    proptest! {
        #[test]
        fn prop_queue_key_round_trips(
            queue in "[a-zA-Z0-9/_-]{1,40}",
            concurrency_key in proptest::option::of("[a-zA-Z0-9:_-]{1,20}"),
        ) {
            let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Staging);
            let keys = producer();
            let key = keys.queue_key(&env, &queue, concurrency_key.as_deref());
            let parsed = keys.parse_queue_key(&key).unwrap();
            prop_assert_eq!(parsed.organization_id, env.organization_id);
            prop_assert_eq!(parsed.project_id, env.project_id);
            prop_assert_eq!(parsed.environment_id, env.id);
            prop_assert_eq!(parsed.queue, queue);
            prop_assert_eq!(parsed.concurrency_key, concurrency_key);
        }
    }
}
