use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sylva::query::OptimizerConfig;
use thiserror::Error;

/// Settings read from the CLI config file.
#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl CliConfig {
    /// Loads `explicit`, else the default path; a missing file yields defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.clone().or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            Some(config_path) if explicit.is_some() => {
                return Err(ConfigError::Missing {
                    path: config_path.clone(),
                })
            }
            _ => RawConfig::default(),
        };
        Ok(Self { path, data })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Optimizer settings with defaults for absent keys.
    pub fn optimizer(&self) -> OptimizerConfig {
        self.data.optimizer.clone()
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    optimizer: OptimizerConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config file {path} does not exist")]
    Missing { path: PathBuf },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("sylva").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimizer_table_overrides_defaults() {
        let raw: RawConfig = toml::from_str(
            "[optimizer]\nunnest = true\norder_insensitive_functions = [\"count\"]\n",
        )
        .expect("parses");
        assert!(raw.optimizer.unnest);
        assert!(raw.optimizer.projection);
        assert_eq!(raw.optimizer.max_traversals, 64);
        assert_eq!(raw.optimizer.order_insensitive_functions, vec!["count"]);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = CliConfig::load(Some(dir.path().join("absent.toml"))).expect_err("missing");
        assert!(matches!(err, ConfigError::Missing { .. }));
    }
}
