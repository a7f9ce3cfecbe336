// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User configuration stored in `~/.fetchpool/config.json`.
//!
//! Every field has a default, so a missing file or a partial file both load.
//! Command-line flags override whatever is read here.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::{TransferOptions, DEFAULT_DOWNLOAD_DIR, DEFAULT_MAX_RETRIES};

const CONFIG_DIR: &str = ".fetchpool";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where downloads go when no explicit path is given (default: "downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Reconnect attempts after a transient failure (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds to wait between reconnect attempts (default: 3)
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Custom User-Agent header for HTTP requests
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DOWNLOAD_DIR)
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_backoff_secs() -> u64 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            user_agent: None,
        }
    }
}

impl Config {
    /// `~/.fetchpool`
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(CONFIG_DIR))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Load the user's config file, or defaults if it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in config file {}", path.display()))?;

        if config.retry_backoff_secs == 0 {
            tracing::warn!(
                "retry_backoff_secs is 0; failed downloads will reconnect immediately"
            );
        }

        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    /// Defaults applied to every transfer added to a registry.
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            download_dir: self.download_dir.clone(),
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config::load_from(&temp_dir.path().join("config.json")).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.download_dir, PathBuf::from("downloads"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{ "max_retries": 7 }"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.retry_backoff_secs, 3);
        assert_eq!(config.download_dir, PathBuf::from("downloads"));
        assert!(config.user_agent.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested").join("config.json");
        let config = Config {
            download_dir: temp_dir.path().join("out"),
            max_retries: 1,
            retry_backoff_secs: 10,
            user_agent: Some("fetchpool-test/1.0".to_string()),
        };

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);

        let options = config.transfer_options();
        assert_eq!(options.max_retries, 1);
        assert_eq!(options.retry_backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }
}
