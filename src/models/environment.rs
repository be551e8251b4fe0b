use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeEnvironmentType {
    Production,
    Staging,
    Development,
    Preview,
}

impl RuntimeEnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "PRODUCTION",
            Self::Staging => "STAGING",
            Self::Development => "DEVELOPMENT",
            Self::Preview => "PREVIEW",
        }
    }
}

impl fmt::Display for RuntimeEnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuntimeEnvironmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRODUCTION" => Ok(Self::Production),
            "STAGING" => Ok(Self::Staging),
            "DEVELOPMENT" => Ok(Self::Development),
            "PREVIEW" => Ok(Self::Preview),
            _ => Err(format!("Invalid environment type: {s}")),
        }
    }
}

/// The environment a run belongs to, with the ids needed to key queues and
/// concurrency sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedEnvironment {
    pub id: Uuid,
    pub env_type: RuntimeEnvironmentType,
    pub project_id: Uuid,
    pub organization_id: Uuid,
    /// Explicit environment-wide concurrency ceiling
    pub maximum_concurrency_limit: Option<u32>,
}

impl AuthenticatedEnvironment {
    pub fn new(env_type: RuntimeEnvironmentType) -> Self {
        Self {
            id: Uuid::now_v7(),
            env_type,
            project_id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            maximum_concurrency_limit: None,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
        self.maximum_concurrency_limit = Some(limit);
        self
    }
}

/// A machine size a run can execute on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachinePreset {
    pub name: String,
    pub cpu: f64,
    /// GB
    pub memory: f64,
    pub cents_per_ms: f64,
}

impl MachinePreset {
    pub fn new(name: &str, cpu: f64, memory: f64, cents_per_ms: f64) -> Self {
        Self {
            name: name.to_string(),
            cpu,
            memory,
            cents_per_ms,
        }
    }
}
