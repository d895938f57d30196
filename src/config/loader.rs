//! # Configuration Loader
//!
//! Environment-aware configuration loading. Layers, lowest precedence first:
//! crate defaults, `dispatch.toml`, `dispatch.{environment}.toml`, then
//! `DISPATCH_*` environment variables (nested keys separated by `__`, e.g.
//! `DISPATCH_SCHEDULER__MAX_CONCURRENT=8`).

use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::DispatchConfig;
use crate::error::{DispatchError, Result};

const ENV_PREFIX: &str = "DISPATCH";
const BASE_FILE: &str = "dispatch";

/// Loads [`DispatchConfig`] from files and the process environment.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with environment auto-detection, searching the
    /// `config/` directory relative to the working directory.
    pub fn load() -> Result<DispatchConfig> {
        Self::load_from_directory(Path::new("config"), &Self::detect_environment())
    }

    /// Load configuration from a specific directory with an explicit
    /// environment. Useful for tests that must not touch process globals.
    pub fn load_from_directory(config_dir: &Path, environment: &str) -> Result<DispatchConfig> {
        debug!(
            environment = %environment,
            config_dir = %config_dir.display(),
            "loading dispatch configuration"
        );

        let base = Self::file_path(config_dir, BASE_FILE);
        let overlay = Self::file_path(config_dir, &format!("{BASE_FILE}.{environment}"));

        let builder = Config::builder()
            .add_source(
                Config::try_from(&DispatchConfig::default())
                    .map_err(|e| DispatchError::Configuration(e.to_string()))?,
            )
            .add_source(File::from(base).required(false))
            .add_source(File::from(overlay).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: DispatchConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DispatchError::Configuration(e.to_string()))?;

        config.validate()?;

        debug!(
            max_concurrent = config.scheduler.max_concurrent,
            preemption_threshold = config.scheduler.preemption_threshold,
            retry_services = config.retry.services.len(),
            "dispatch configuration loaded"
        );

        Ok(config)
    }

    /// Detect environment from `DISPATCH_ENV` / `APP_ENV`, defaulting to
    /// `development`.
    pub fn detect_environment() -> String {
        env::var("DISPATCH_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn file_path(config_dir: &Path, stem: &str) -> PathBuf {
        config_dir.join(format!("{stem}.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ConfigLoader::load_from_directory(dir.path(), "test").expect("load");
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.retry.default.max_attempts, 3);
    }

    #[test]
    fn base_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("dispatch.toml"),
            r#"
            [scheduler]
            max_concurrent = 12

            [retry.services.llm]
            max_attempts = 5
            initial_backoff_ms = 250
            "#,
        )
        .expect("write config");

        let config = ConfigLoader::load_from_directory(dir.path(), "test").expect("load");
        assert_eq!(config.scheduler.max_concurrent, 12);
        // untouched sections keep their defaults
        assert_eq!(config.scheduler.preemption_threshold, 8);
        assert_eq!(config.retry.policy_for("llm").max_attempts, 5);
        assert_eq!(config.retry.policy_for("llm").initial_backoff_ms, 250);
    }

    #[test]
    fn environment_overlay_wins_over_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("dispatch.toml"),
            "[scheduler]\nmax_concurrent = 2\n",
        )
        .expect("write base");
        fs::write(
            dir.path().join("dispatch.production.toml"),
            "[scheduler]\nmax_concurrent = 32\n",
        )
        .expect("write overlay");

        let config = ConfigLoader::load_from_directory(dir.path(), "production").expect("load");
        assert_eq!(config.scheduler.max_concurrent, 32);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("dispatch.toml"),
            "[scheduler]\nmax_concurrent = 0\n",
        )
        .expect("write config");

        let result = ConfigLoader::load_from_directory(dir.path(), "test");
        assert!(matches!(result, Err(DispatchError::Configuration(_))));
    }
}
