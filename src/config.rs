use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{NodeError, NodeResult};
use crate::ledger::DEFAULT_STATE_EXPIRY_SECS;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub rpc_listen: SocketAddr,
    #[serde(default = "default_persist_ledger")]
    pub persist_ledger: bool,
    #[serde(default = "default_max_elections_time_ms")]
    pub max_elections_time_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_state_expiry_secs")]
    pub default_state_expiry_secs: u64,
}

fn default_persist_ledger() -> bool {
    true
}

fn default_max_elections_time_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_state_expiry_secs() -> u64 {
    DEFAULT_STATE_EXPIRY_SECS
}

impl NodeConfig {
    /// Reads and validates a configuration; a file that parses but cannot
    /// run a single election is rejected here rather than at first use.
    pub fn load(path: &Path) -> NodeResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|err| NodeError::Config(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// The tunables must describe a workable election: a zero ceiling ends
    /// every election before its first vote, and a poll slower than the
    /// ceiling never reaches the peers at all.
    pub fn validate(&self) -> NodeResult<()> {
        if self.max_elections_time_ms == 0 {
            return Err(NodeError::Config(
                "max_elections_time_ms must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(NodeError::Config("poll_interval_ms must be positive".into()));
        }
        if self.poll_interval_ms > self.max_elections_time_ms {
            return Err(NodeError::Config(
                "poll_interval_ms exceeds max_elections_time_ms; peers would never be polled"
                    .into(),
            ));
        }
        if self.default_state_expiry_secs == 0 {
            return Err(NodeError::Config(
                "default_state_expiry_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> NodeResult<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| NodeError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Creates the directories a node will actually touch: the data
    /// directory only when the ledger persists, and the identity parent
    /// always.
    pub fn ensure_directories(&self) -> NodeResult<()> {
        if self.persist_ledger {
            fs::create_dir_all(&self.data_dir)?;
        }
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn max_elections_time(&self) -> Duration {
        Duration::from_millis(self.max_elections_time_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            rpc_listen: "127.0.0.1:7070".parse().expect("valid socket addr"),
            persist_ledger: default_persist_ledger(),
            max_elections_time_ms: default_max_elections_time_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            default_state_expiry_secs: default_state_expiry_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/node.toml");
        let config = NodeConfig::default();
        config.save(&path).unwrap();
        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.rpc_listen, config.rpc_listen);
        assert_eq!(loaded.max_elections_time_ms, config.max_elections_time_ms);
    }

    #[test]
    fn missing_tunables_fall_back_to_defaults() {
        let parsed: NodeConfig = toml::from_str(
            "data_dir = \"./data\"\nkey_path = \"./keys/node.toml\"\nrpc_listen = \"127.0.0.1:7070\"\n",
        )
        .unwrap();
        assert!(parsed.persist_ledger);
        assert_eq!(parsed.max_elections_time_ms, 30_000);
        assert_eq!(parsed.poll_interval_ms, 500);
        assert_eq!(parsed.default_state_expiry_secs, DEFAULT_STATE_EXPIRY_SECS);
    }

    #[test]
    fn unworkable_tunables_are_rejected() {
        let mut config = NodeConfig::default();
        config.max_elections_time_ms = 0;
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let mut config = NodeConfig::default();
        config.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let mut config = NodeConfig::default();
        config.poll_interval_ms = config.max_elections_time_ms + 1;
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let mut config = NodeConfig::default();
        config.default_state_expiry_secs = 0;
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn load_rejects_an_unworkable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(
            &path,
            "data_dir = \"./data\"\nkey_path = \"./keys/node.toml\"\nrpc_listen = \"127.0.0.1:7070\"\nmax_elections_time_ms = 1000\npoll_interval_ms = 60000\n",
        )
        .unwrap();
        assert!(matches!(
            NodeConfig::load(&path),
            Err(NodeError::Config(_))
        ));
    }
}
