//! Configuration
//!
//! Everything has a default, so an empty JSON object is a valid config file.
//! Environment variables override the backend URL, partition prefix and data
//! directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reference::ReferenceConfig;
use crate::replication::ReplicationConfig;
use crate::store::{PartitionId, StoreConfig, StoreError};

pub const ENV_BACKEND_URL: &str = "FIELDSYNC_BACKEND_URL";
pub const ENV_DB_PREFIX: &str = "FIELDSYNC_DB_PREFIX";
pub const ENV_DATA_DIR: &str = "FIELDSYNC_DATA_DIR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub backend_url: String,
    /// Path under the backend where partitions are exposed
    pub couchdb_path: String,
    /// Partition names are `{db_prefix}_ws_{tenant}`
    pub db_prefix: String,
    /// Where stores and checkpoints live; in memory when unset
    pub data_dir: Option<PathBuf>,
    pub replication: ReplicationConfig,
    pub reference: ReferenceConfig,
    pub store: StoreConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8080".to_string(),
            couchdb_path: "/api/couchdb".to_string(),
            db_prefix: "db".to_string(),
            data_dir: None,
            replication: ReplicationConfig::default(),
            reference: ReferenceConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config: SyncConfig =
            serde_json::from_slice(&data).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BACKEND_URL).filter(|v| !v.is_empty()) {
            self.backend_url = url;
        }
        if let Some(prefix) = lookup(ENV_DB_PREFIX).filter(|v| !v.is_empty()) {
            self.db_prefix = prefix;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "backend_url must be http(s): {}",
                self.backend_url
            )));
        }
        if self.db_prefix.is_empty() {
            return Err(ConfigError::Invalid("db_prefix is empty".to_string()));
        }
        if self.replication.batch_size == 0 {
            return Err(ConfigError::Invalid("replication.batch_size must be at least 1".to_string()));
        }
        let backoff = &self.replication.backoff;
        if backoff.max_ms < backoff.initial_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff.max_ms ({}) is below backoff.initial_ms ({})",
                backoff.max_ms, backoff.initial_ms
            )));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(ConfigError::Invalid(format!("backoff.jitter {} is outside 0..=1", backoff.jitter)));
        }
        Ok(())
    }

    /// The partition for `tenant` under this config's prefix
    pub fn partition_for(&self, tenant: &str) -> Result<PartitionId, StoreError> {
        PartitionId::for_tenant(&self.db_prefix, tenant)
    }

    /// Identifies the remote in checkpoints
    pub fn peer_id(&self) -> String {
        format!(
            "{}{}",
            self.backend_url.trim_end_matches('/'),
            self.couchdb_path.trim_end_matches('/')
        )
    }
}
