use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bstore_stage::TransferConfig;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Which stored entries a data sweep examines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSweep {
    /// Every entry under `data/`.
    Immediate,
    /// Only entries older than `data_retention_secs`.
    #[default]
    Background,
}

/// Store settings, passed explicitly to every component.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store home; `data/` and `temp/` live beneath it.
    pub root: PathBuf,
    #[serde(default = "default_temp_retention")]
    pub temp_retention_secs: u64,
    #[serde(default = "default_data_retention")]
    pub data_retention_secs: u64,
    #[serde(default)]
    pub data_sweep: DataSweep,
    /// Per-source deadline for staging; unbounded when absent.
    #[serde(default)]
    pub source_timeout_secs: Option<u64>,
    #[serde(default = "default_git_program")]
    pub git_program: PathBuf,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_temp_retention() -> u64 {
    3600
}

fn default_data_retention() -> u64 {
    60
}

fn default_git_program() -> PathBuf {
    PathBuf::from("git")
}

fn default_user_agent() -> String {
    TransferConfig::default().user_agent
}

impl StoreConfig {
    /// Defaults for everything but the root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            temp_retention_secs: default_temp_retention(),
            data_retention_secs: default_data_retention(),
            data_sweep: DataSweep::default(),
            source_timeout_secs: None,
            git_program: default_git_program(),
            user_agent: default_user_agent(),
        }
    }

    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        toml::from_str(text).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Read a TOML config file. A relative `root` is resolved against the
    /// file's directory.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        if config.root.is_relative() {
            if let Some(dir) = path.parent() {
                config.root = dir.join(&config.root);
            }
        }
        Ok(config)
    }

    pub fn temp_retention(&self) -> Duration {
        Duration::from_secs(self.temp_retention_secs)
    }

    pub fn data_retention(&self) -> Duration {
        Duration::from_secs(self.data_retention_secs)
    }

    pub fn source_timeout(&self) -> Option<Duration> {
        self.source_timeout_secs.map(Duration::from_secs)
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            user_agent: self.user_agent.clone(),
            git_program: self.git_program.clone(),
            ..TransferConfig::default()
        }
    }
}
