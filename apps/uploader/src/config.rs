//! Uploader configuration.
//!
//! Stored as TOML at `$XDG_CONFIG_HOME/dagflow/uploader.toml` unless a
//! path is given on the command line.

use std::path::{Path, PathBuf};

use anyhow::Context;
use dagflow_upload_queue::QueueConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_ENDPOINT: &str = "http://localhost:8080/api/v1/files/";

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// tus creation endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Fingerprint store file. Unset means the per-user default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            store_path: None,
            queue: QueueConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration at `path` (or the default location),
    /// writing defaults there first if the file does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    dagflow_transfer::app_config_dir()
        .map(|d| d.join("uploader.toml"))
        .context("cannot determine the configuration directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert!(config.store_path.is_none());
        assert_eq!(config.queue.concurrency_limit, 3);
    }

    #[test]
    fn load_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("uploader.toml");

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let again = Config::load(Some(&path)).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploader.toml");
        std::fs::write(
            &path,
            "endpoint = \"https://files.example.com/upload/\"\n\n[queue]\ngroup_id = \"task-42\"\nconcurrency_limit = 5\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.endpoint, "https://files.example.com/upload/");
        assert_eq!(config.queue.group_id, "task-42");
        assert_eq!(config.queue.concurrency_limit, 5);
        assert_eq!(config.queue.parallel_chunks, 6);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploader.toml");
        std::fs::write(&path, "endpoint = [").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
