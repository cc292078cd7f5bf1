use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::raft::{FileLog, MemLog, RaftConfig, RaftError, RaftLog};

/// Node configuration as read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub address: String,
    pub members: Vec<String>,
    pub timing: TimingConfig,
    pub storage: StorageConfig,
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    pub rpc_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "file")]
    File { data_dir: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File {
            data_dir: "./data".to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        let defaults = RaftConfig::new("");
        Self {
            election_timeout_min: defaults.election_timeout_min,
            election_timeout_max: defaults.election_timeout_max,
            heartbeat_interval: defaults.heartbeat_interval,
            rpc_timeout: defaults.rpc_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9090".to_string(),
            members: vec![],
            timing: TimingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
        let config = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// The runtime configuration, validated.
    pub fn raft_config(&self) -> Result<RaftConfig, RaftError> {
        let mut config = RaftConfig::new(&self.address)
            .with_members(&self.members)
            .with_timing(
                self.timing.election_timeout_min,
                self.timing.election_timeout_max,
                self.timing.heartbeat_interval,
            );
        config.rpc_timeout = self.timing.rpc_timeout;
        config.validate()?;
        Ok(config)
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        match &self.storage {
            StorageConfig::Memory => None,
            StorageConfig::File { data_dir } => Some(PathBuf::from(data_dir)),
        }
    }

    pub fn open_log(&self) -> Result<Arc<dyn RaftLog>, RaftError> {
        Ok(match self.data_dir() {
            None => Arc::new(MemLog::new()),
            Some(data_dir) => Arc::new(FileLog::open(data_dir)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn storage_config_default_uses_file_data_dir() {
        match StorageConfig::default() {
            StorageConfig::File { data_dir } => assert_eq!(data_dir, "./data"),
            StorageConfig::Memory => panic!("expected file storage"),
        }
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"address":"10.0.0.1:9090","members":["10.0.0.2:9090"],"storage":{"type":"memory"}}"#,
        )
        .expect("parse");
        assert_eq!(cfg.timing.election_timeout_min, 150);
        assert_eq!(cfg.timing.heartbeat_interval, 50);
        assert!(cfg.data_dir().is_none());

        let raft = cfg.raft_config().expect("valid");
        assert_eq!(raft.address, "10.0.0.1:9090");
        assert!(raft.members.contains("10.0.0.2:9090"));
    }

    #[test]
    fn own_address_in_members_is_dropped() {
        let cfg = Config {
            address: "a:1".into(),
            members: vec!["a:1".into(), "b:1".into()],
            ..Config::default()
        };
        let raft = cfg.raft_config().expect("valid");
        assert_eq!(raft.members.len(), 1);
    }

    #[test]
    fn bad_timing_is_rejected() {
        let cfg = Config {
            timing: TimingConfig {
                heartbeat_interval: 500,
                ..TimingConfig::default()
            },
            ..Config::default()
        };
        assert!(matches!(cfg.raft_config(), Err(RaftError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn file_storage_opens_a_durable_log() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ballot.json");
        let data_dir = dir.path().join("node");
        std::fs::write(
            &path,
            serde_json::json!({
                "address": "a:1",
                "storage": {"type": "file", "data_dir": data_dir.to_string_lossy()}
            })
            .to_string(),
        )
        .expect("write config");

        let cfg = Config::load(&path).expect("load");
        let log = cfg.open_log().expect("open");
        assert_eq!(log.last_index().await.expect("last index"), 0);
    }
}
