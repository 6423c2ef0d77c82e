//! Node configuration with TOML file support

use crate::constants::{DEFAULT_BAN_THRESHOLD, SYNC_BATCH_SIZE};
use crate::error::{NodeError, Result};
use crate::logging::LogFormat;
use crate::params::{ChainParams, MempoolPolicy};
use crate::types::{KeyHash, LockingCondition};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const DEFAULT_PERSIST_RETRY_SECS: u64 = 30;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Hex key hash the coinbase pays to; anyone-can-spend if unset
    #[serde(default)]
    pub recipient_key_hash: Option<String>,

    /// Nonces per search round before the miner re-checks its template
    #[serde(default = "default_nonce_batch")]
    pub nonce_batch: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        MiningConfig {
            enabled: false,
            recipient_key_hash: None,
            nonce_batch: default_nonce_batch(),
        }
    }
}

impl MiningConfig {
    /// Locking condition of the coinbase output
    pub fn recipient(&self) -> Result<LockingCondition> {
        let Some(text) = &self.recipient_key_hash else {
            return Ok(LockingCondition::AnyoneCanSpend);
        };
        let bytes = hex::decode(text)
            .map_err(|e| NodeError::Config(format!("mining.recipient_key_hash: {}", e)))?;
        let key_hash: KeyHash = bytes.try_into().map_err(|_| {
            NodeError::Config("mining.recipient_key_hash must be 20 bytes".to_string())
        })?;
        Ok(LockingCondition::PayToKeyHash { key_hash })
    }
}

/// Configuration for a node.
///
/// Loaded from a TOML file via [`NodeConfig::from_toml_file`] or built
/// programmatically (e.g. for tests).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the chain state and peer list
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    #[serde(default)]
    pub bootstrap_peers: Vec<SocketAddr>,

    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_peer_idle_timeout_secs")]
    pub peer_idle_timeout_secs: u64,

    #[serde(default = "default_getpeers_interval_secs")]
    pub getpeers_interval_secs: u64,

    /// Peer score at or below which the peer is banned
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: i32,

    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: u64,

    /// Announce new blocks as compact blocks
    #[serde(default = "default_true")]
    pub compact_relay: bool,

    /// "human" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Interval for flushing mempool changes and retrying failed saves
    #[serde(default = "default_persist_retry_secs")]
    pub persist_retry_secs: u64,

    #[serde(default)]
    pub mining: MiningConfig,

    #[serde(default)]
    pub chain: ChainParams,

    #[serde(default)]
    pub mempool: MempoolPolicy,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("./node_data")
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8333))
}

fn default_max_peers() -> usize {
    8
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_peer_idle_timeout_secs() -> u64 {
    120
}

fn default_getpeers_interval_secs() -> u64 {
    60
}

fn default_ban_threshold() -> i32 {
    DEFAULT_BAN_THRESHOLD
}

fn default_sync_batch_size() -> u64 {
    SYNC_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_persist_retry_secs() -> u64 {
    DEFAULT_PERSIST_RETRY_SECS
}

fn default_nonce_batch() -> u64 {
    100_000
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.chain.validate()?;
        if self.sync_batch_size == 0 {
            return Err(NodeError::Config("sync_batch_size must be positive".to_string()));
        }
        if self.max_peers == 0 {
            return Err(NodeError::Config("max_peers must be positive".to_string()));
        }
        if self.ban_threshold >= 0 {
            return Err(NodeError::Config("ban_threshold must be negative".to_string()));
        }
        self.log_format.parse::<LogFormat>()?;
        self.mining.recipient()?;
        Ok(())
    }

    /// Configuration for a throwaway local node: loopback on an ephemeral
    /// port, regtest chain, no bootstrap peers
    pub fn local(data_dir: impl Into<PathBuf>) -> Self {
        NodeConfig {
            data_dir: data_dir.into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            chain: ChainParams::regtest(),
            ..NodeConfig::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: default_data_dir(),
            listen_addr: default_listen_addr(),
            bootstrap_peers: Vec::new(),
            max_peers: default_max_peers(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            peer_idle_timeout_secs: default_peer_idle_timeout_secs(),
            getpeers_interval_secs: default_getpeers_interval_secs(),
            ban_threshold: default_ban_threshold(),
            sync_batch_size: default_sync_batch_size(),
            compact_relay: default_true(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            persist_retry_secs: default_persist_retry_secs(),
            mining: MiningConfig::default(),
            chain: ChainParams::default(),
            mempool: MempoolPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = NodeConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = NodeConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.sync_batch_size, 500);
        assert_eq!(config.ping_interval_secs, 30);
        assert_eq!(config.peer_idle_timeout_secs, 120);
        assert_eq!(config.chain, ChainParams::default());
        assert!(!config.mining.enabled);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let toml = r#"
            max_peers = 3
            bootstrap_peers = ["127.0.0.1:9001"]

            [mining]
            enabled = true
            recipient_key_hash = "0101010101010101010101010101010101010101"

            [chain]
            halving_interval = 10
        "#;
        let config = NodeConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.max_peers, 3);
        assert_eq!(config.bootstrap_peers, vec!["127.0.0.1:9001".parse().unwrap()]);
        assert_eq!(config.chain.halving_interval, 10);
        assert_eq!(config.chain.initial_reward, 50);
        assert_eq!(
            config.mining.recipient().unwrap(),
            LockingCondition::PayToKeyHash { key_hash: [1; 20] }
        );
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        assert!(matches!(
            NodeConfig::from_toml_str("log_format = \"xml\""),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("[mining]\nrecipient_key_hash = \"abcd\""),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("[chain]\nhalving_interval = 0"),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_returns_config_error() {
        let result = NodeConfig::from_toml_file("/nonexistent/node.toml");
        assert!(matches!(result, Err(NodeError::Config(_))));
    }
}
