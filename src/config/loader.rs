//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered, later ones
//! winning:
//!
//! 1. `<dir>/run-engine.toml`
//! 2. `<dir>/run-engine.<environment>.toml`
//! 3. `RUN_ENGINE__SECTION__KEY` environment variables
//!
//! Missing files are not an error; every field has a default.

use super::EngineConfig;
use crate::error::EngineResult;
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_NAME: &str = "run-engine";
const ENV_PREFIX: &str = "RUN_ENGINE";

#[derive(Debug)]
pub struct ConfigManager {
    config: EngineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> EngineResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> EngineResult<Arc<ConfigManager>> {
        let environment = crate::logging::get_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for tests that should not touch process-wide environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> EngineResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading run engine configuration"
        );

        let config = Self::build(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = environment,
            default_env_concurrency = config.queue.default_env_concurrency,
            warm_start_threshold_ms = config.retry.warm_start_threshold_ms,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    fn build(directory: &Path, environment: &str) -> EngineResult<EngineConfig> {
        let base = directory.join(format!("{BASE_FILE_NAME}.toml"));
        let overlay = directory.join(format!("{BASE_FILE_NAME}.{environment}.toml"));

        let config = Config::builder()
            .add_source(File::new(&base.to_string_lossy(), FileFormat::Toml).required(false))
            .add_source(File::new(&overlay.to_string_lossy(), FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize::<EngineConfig>()?)
    }

    fn default_config_directory() -> PathBuf {
        std::env::var("RUN_ENGINE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchZeroSuccessPolicy;
    use std::io::Write;

    #[test]
    fn test_missing_directory_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().join("absent")), "test")
                .unwrap();
        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().queue.default_env_concurrency, 100);
    }

    #[test]
    fn test_environment_overlay_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut base = std::fs::File::create(dir.path().join("run-engine.toml")).unwrap();
        writeln!(
            base,
            "[retry]\nwarm_start_threshold_ms = 1000\n\n[batch]\nzero_success_policy = \"complete\""
        )
        .unwrap();
        let mut overlay = std::fs::File::create(dir.path().join("run-engine.test.toml")).unwrap();
        writeln!(overlay, "[retry]\nwarm_start_threshold_ms = 5").unwrap();

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        assert_eq!(manager.config().retry.warm_start_threshold_ms, 5);
        assert_eq!(
            manager.config().batch.zero_success_policy,
            BatchZeroSuccessPolicy::Complete
        );
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut base = std::fs::File::create(dir.path().join("run-engine.toml")).unwrap();
        writeln!(base, "[queue]\ndefault_env_concurrency = 0").unwrap();
        assert!(
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .is_err()
        );
    }
}
