//! Configuration file support for the CLI.
//!
//! The engine configuration is read from the `--config` file if given, else
//! from `meridian.toml` in the data directory, else defaults are used.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use meridian_engine::EngineConfig;

/// Name of the configuration file looked up in the data directory.
pub const DEFAULT_CONFIG_FILE: &str = "meridian.toml";

/// Resolved CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Engine root directory.
    pub data_dir: PathBuf,
    /// File the engine configuration came from, if any.
    pub source: Option<PathBuf>,
    /// Engine configuration.
    pub engine: EngineConfig,
}

impl CliConfig {
    /// Loads the configuration for `data_dir`.
    pub fn load(data_dir: &Path, config: Option<&Path>) -> Result<Self> {
        let source = match config {
            Some(path) => Some(path.to_path_buf()),
            None => Some(data_dir.join(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };
        let engine = match &source {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => EngineConfig::default(),
        };
        engine
            .validate()
            .map_err(|reason| anyhow!("invalid configuration: {reason}"))?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            source,
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = CliConfig::load(temp_dir.path(), None).unwrap();
        assert!(config.source.is_none());
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_file_in_data_dir() {
        let temp_dir = TempDir::new().unwrap();
        let engine = EngineConfig::builder().sync(false).build();
        engine.save(&temp_dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();

        let config = CliConfig::load(temp_dir.path(), None).unwrap();
        assert!(config.source.is_some());
        assert_eq!(config.engine, engine);
    }

    #[test]
    fn test_explicit_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
                [workers]
                worker_count = 4
            "#,
        )
        .unwrap();

        let config = CliConfig::load(temp_dir.path(), Some(&path)).unwrap();
        assert_eq!(config.engine.workers.worker_count, 4);
        assert_eq!(config.engine.apply, EngineConfig::default().apply);
    }

    #[test]
    fn test_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(&path, "[workers]\nworker_count = 0\n").unwrap();
        assert!(CliConfig::load(temp_dir.path(), Some(&path)).is_err());

        let missing = temp_dir.path().join("missing.toml");
        assert!(CliConfig::load(temp_dir.path(), Some(&missing)).is_err());
    }
}
