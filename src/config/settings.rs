use crate::core::DEFAULT_DIFFICULTY;
use crate::error::{BlockchainError, Result};
use crate::wallet::validate_address;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

static DEFAULT_NODE_ADDR: &str = "127.0.0.1:2001";
static DEFAULT_DATA_DIR: &str = "data";

pub const DEFAULT_MAX_PEERS: usize = 25;

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const MINING_ADDRESS_KEY: &str = "MINING_ADDRESS";
const NODE_DATA_DIR_KEY: &str = "NODE_DATA_DIR";

/// Node settings, passed by value into the ledger and server.
///
/// Precedence, lowest first: defaults, TOML file, environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub seeds: Vec<String>,
    pub max_peers: usize,
    pub difficulty: u32,
    pub mining_address: Option<String>,
    pub mining_interval_secs: u64,
    pub mine_empty_blocks: bool,
    /// When false, relay messages are handled before the handshake finishes.
    pub require_handshake: bool,
    pub dial_timeout_ms: u64,
    pub agent: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            listen_addr: String::from(DEFAULT_NODE_ADDR),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            seeds: vec![],
            max_peers: DEFAULT_MAX_PEERS,
            difficulty: DEFAULT_DIFFICULTY,
            mining_address: None,
            mining_interval_secs: 2,
            mine_empty_blocks: true,
            require_handshake: true,
            dial_timeout_ms: 5000,
            agent: format!("utxo-chain/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl NodeConfig {
    /// Defaults, overlaid with `path` when given, then with the environment.
    pub fn load(path: Option<&Path>) -> Result<NodeConfig> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => NodeConfig::default(),
        };
        config.apply_env_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<NodeConfig> {
        let contents = fs::read_to_string(path).map_err(|e| {
            BlockchainError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<NodeConfig> {
        toml::from_str(contents)
            .map_err(|e| BlockchainError::Config(format!("Invalid configuration: {e}")))
    }

    /// `lookup` stands in for `std::env::var`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup(NODE_ADDRESS_KEY) {
            self.listen_addr = addr;
        }
        if let Some(addr) = lookup(MINING_ADDRESS_KEY) {
            self.mining_address = Some(addr);
        }
        if let Some(dir) = lookup(NODE_DATA_DIR_KEY) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr.parse::<SocketAddr>().map_err(|e| {
            BlockchainError::Config(format!("Invalid listen address {}: {e}", self.listen_addr))
        })?;
        if self.max_peers == 0 {
            return Err(BlockchainError::Config(
                "max_peers must be at least 1".to_string(),
            ));
        }
        if !(1..=255).contains(&self.difficulty) {
            return Err(BlockchainError::Config(format!(
                "difficulty must be within 1..=255, got {}",
                self.difficulty
            )));
        }
        if let Some(address) = &self.mining_address {
            if !validate_address(address) {
                return Err(BlockchainError::Config(format!(
                    "Invalid mining address: {address}"
                )));
            }
        }
        if self.mining_interval_secs == 0 {
            return Err(BlockchainError::Config(
                "mining_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_miner(&self) -> bool {
        self.mining_address.is_some()
    }

    pub fn mining_interval(&self) -> Duration {
        Duration::from_secs(self.mining_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}
