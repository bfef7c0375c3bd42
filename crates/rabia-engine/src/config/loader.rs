//! Configuration loader with multi-source merging

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{ConfigError, EngineConfig};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: "RABIA".to_string(),
        }
    }

    /// Reads a TOML file on top of the defaults. The file must exist.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "RABIA")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<EngineConfig> {
        let mut builder = ::config::Config::builder();

        // 1. Built-in defaults
        let defaults = EngineConfig::default();
        builder = builder.add_source(::config::Config::try_from(&defaults)?);

        // 2. Explicit config file
        if let Some(path) = &self.file {
            if !path.exists() {
                return Err(ConfigError::ReadError {
                    path: path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
                }
                .into());
            }
            builder = builder.add_source(
                ::config::File::from(path.as_path())
                    .required(true)
                    .format(::config::FileFormat::Toml),
            );
        }

        // 3. Environment variables (RABIA_PIPELINE_DEPTH=8, ...)
        builder = builder.add_source(
            ::config::Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder.build().context("Failed to build configuration")?;
        let config: EngineConfig = merged
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;

        tracing::debug!(
            file = ?self.file,
            pipeline_depth = config.pipeline_depth,
            cache = config.phase_cache_capacity,
            "loaded engine configuration"
        );
        Ok(config)
    }

    /// Load configuration or return defaults if loading fails
    pub fn load_or_default(self) -> EngineConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let config = ConfigLoader::new()
            .with_env_prefix("RABIA_TEST_DEFAULTS")
            .load()
            .expect("Failed to load config");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("rabia.toml");
        fs::write(
            &path,
            "phase_cache_capacity = 4096\nretransmit_interval_ticks = 7\n",
        )
        .expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_file(&path)
            .with_env_prefix("RABIA_TEST_FILE")
            .load()
            .expect("Failed to load config");
        assert_eq!(config.phase_cache_capacity, 4096);
        assert_eq!(config.retransmit_interval_ticks, 7);
        assert_eq!(config.pipeline_depth, 4);
    }

    #[test]
    fn test_missing_file_is_error() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let result = ConfigLoader::new()
            .with_file(temp_dir.path().join("absent.toml"))
            .load();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_file_falls_back_with_load_or_default() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("rabia.toml");
        fs::write(&path, "pipeline_depth = 0\n").expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_file(&path)
            .with_env_prefix("RABIA_TEST_INVALID")
            .load_or_default();
        assert_eq!(config, EngineConfig::default());
    }
}
