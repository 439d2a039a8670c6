//! Configuration management for the VSportChain node

use crate::consensus::EthashConfig;
use crate::crypto::Address;
use crate::error::ChainError;
use crate::p2p::ServerConfig;
use crate::params::{BLOOM_BITS_BLOCKS, BLOOM_CONFIRMS, MAINNET_NETWORK_ID};
use crate::txpool::TxPoolConfig;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    #[default]
    Fast,
    Light,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Fast => write!(f, "fast"),
            SyncMode::Light => write!(f, "light"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncMode::Full),
            "fast" => Ok(SyncMode::Fast),
            "light" => Ok(SyncMode::Light),
            other => Err(ChainError::Configuration(format!("invalid sync mode {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// JSON genesis file. The stored (or mainnet) genesis is used when unset.
    #[serde(default)]
    pub genesis: Option<PathBuf>,
    #[serde(default = "default_network_id")]
    pub network_id: u64,
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Runs an ephemeral in-memory node when unset.
    #[serde(default = "default_data_dir")]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_database_cache")]
    pub database_cache: usize,
    #[serde(default)]
    pub skip_bc_version_check: bool,

    #[serde(default)]
    pub light_serv: u32,
    #[serde(default)]
    pub light_peers: usize,
    #[serde(default)]
    pub p2p: ServerConfig,
    #[serde(
        default = "default_sync_cycle",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub sync_cycle: Duration,

    #[serde(default)]
    pub etherbase: Address,
    #[serde(default = "default_gas_price")]
    pub gas_price: u64,
    #[serde(default)]
    pub extra_data: Option<String>,
    /// Start sealing right after the node is up.
    #[serde(default)]
    pub mine: bool,
    #[serde(default = "default_miner_threads")]
    pub miner_threads: i32,

    #[serde(default)]
    pub ethash: EthashConfig,
    #[serde(default)]
    pub tx_pool: TxPoolConfig,

    #[serde(default = "default_bloom_section_size")]
    pub bloom_section_size: u64,
    #[serde(default = "default_bloom_confirms")]
    pub bloom_confirms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            genesis: None,
            network_id: default_network_id(),
            sync_mode: SyncMode::default(),
            data_dir: default_data_dir(),
            database_cache: default_database_cache(),
            skip_bc_version_check: false,
            light_serv: 0,
            light_peers: 0,
            p2p: ServerConfig::default(),
            sync_cycle: default_sync_cycle(),
            etherbase: Address::zero(),
            gas_price: default_gas_price(),
            extra_data: None,
            mine: false,
            miner_threads: default_miner_threads(),
            ethash: EthashConfig::default(),
            tx_pool: TxPoolConfig::default(),
            bloom_section_size: default_bloom_section_size(),
            bloom_confirms: default_bloom_confirms(),
        }
    }
}

impl NodeConfig {
    /// Configuration for a throwaway node without a data directory.
    pub fn ephemeral() -> Self {
        NodeConfig {
            data_dir: None,
            ..NodeConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.sync_mode == SyncMode::Light {
            return Err(ChainError::Configuration(
                "can't run a full node in light sync mode, use the light client".to_string(),
            ));
        }
        if self.bloom_section_size == 0 {
            return Err(ChainError::Configuration("bloom_section_size must be positive".to_string()));
        }
        if self.p2p.max_peers == 0 {
            return Err(ChainError::Configuration("p2p.max_peers must be positive".to_string()));
        }
        Ok(())
    }
}

/// Loads a TOML config file; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<NodeConfig, ChainError> {
    let config: NodeConfig = match fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)
            .map_err(|e| ChainError::Configuration(format!("{}: {}", path.display(), e)))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No config file at {}, using defaults", path.display());
            NodeConfig::default()
        }
        Err(e) => return Err(e.into()),
    };
    config.validate()?;
    Ok(config)
}

fn default_network_id() -> u64 {
    MAINNET_NETWORK_ID
}

fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".vscnode"))
}

fn default_database_cache() -> usize {
    768
}

fn default_sync_cycle() -> Duration {
    Duration::from_secs(10)
}

fn default_gas_price() -> u64 {
    18_000_000_000
}

fn default_miner_threads() -> i32 {
    0
}

fn default_bloom_section_size() -> u64 {
    BLOOM_BITS_BLOCKS
}

fn default_bloom_confirms() -> u64 {
    BLOOM_CONFIRMS
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::PowMode;
    use tempfile::tempdir;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            network_id = 4
            sync_mode = "full"
            sync_cycle = "2s 500ms"
            etherbase = "0x0101010101010101010101010101010101010101"
            gas_price = 1
            light_serv = 10
            light_peers = 5

            [p2p]
            max_peers = 50

            [ethash]
            pow_mode = "fake"

            [tx_pool]
            no_locals = true
        "#;
        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.network_id, 4);
        assert_eq!(config.sync_mode, SyncMode::Full);
        assert_eq!(config.sync_cycle, Duration::from_millis(2500));
        assert_eq!(config.etherbase, Address([1u8; 20]));
        assert_eq!(config.p2p.max_peers, 50);
        assert_eq!(config.ethash.pow_mode, PowMode::Fake);
        assert!(config.tx_pool.no_locals);
        assert_eq!(config.bloom_section_size, BLOOM_BITS_BLOCKS);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.network_id, MAINNET_NETWORK_ID);
        assert_eq!(config.sync_mode, SyncMode::Fast);
    }

    #[test]
    fn test_light_and_unknown_sync_modes_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "sync_mode = \"light\"\n").unwrap();
        assert!(matches!(load_config(&path), Err(ChainError::Configuration(_))));

        fs::write(&path, "sync_mode = \"turbo\"\n").unwrap();
        assert!(matches!(load_config(&path), Err(ChainError::Configuration(_))));
        assert!("turbo".parse::<SyncMode>().is_err());
    }
}
