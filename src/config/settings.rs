use crate::core::{DifficultyPolicy, MAX_DIFFICULTY, MAX_PAGE_TEXT_LEN, MIN_DIFFICULTY};
use crate::network::protocol::{MAX_BLOCKS_PER_RESPONSE, MAX_PAYLOAD_LEN};
use crate::error::{LedgerError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

static DEFAULT_NODE_ADDR: &str = "127.0.0.1:2001";

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const NODE_ID_KEY: &str = "NODE_ID";
const NODE_PEERS_KEY: &str = "NODE_PEERS";
const MINING_KEY: &str = "MINING";
const DIFFICULTY_KEY: &str = "DIFFICULTY";

/// Records per block such that a block of maximum-size pages fills at most
/// half a frame.
pub const MAX_RECORDS_PER_BLOCK: usize = MAX_PAYLOAD_LEN / 2 / MAX_PAGE_TEXT_LEN;

const CHAIN_FILE: &str = "chain.dat";
const PEERS_DIR: &str = "peers";

/// Retargeting parameters; when present the difficulty adjusts every
/// `period` blocks instead of staying fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyAdjustment {
    pub period: u64,
    pub target_block_time_ms: u64,
    pub min: u32,
    pub max: u32,
}

/// Node configuration: defaults, then an optional TOML file, then the
/// environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub node_id: String,
    pub bootstrap_peers: Vec<String>,
    /// Where the chain file and peer database live. Nothing is persisted
    /// when unset.
    pub data_dir: Option<PathBuf>,
    pub difficulty: u32,
    pub difficulty_adjustment: Option<DifficultyAdjustment>,
    pub mining_enabled: bool,
    pub max_records_per_block: usize,
    pub max_peers: usize,
    pub chunk_size: usize,
    pub height_query_interval_ms: u64,
    pub socket_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: DEFAULT_NODE_ADDR.to_string(),
            node_id: uuid::Uuid::new_v4().to_string(),
            bootstrap_peers: Vec::new(),
            data_dir: None,
            difficulty: 16,
            difficulty_adjustment: None,
            mining_enabled: true,
            max_records_per_block: 10,
            max_peers: 8,
            chunk_size: crate::network::protocol::DEFAULT_CHUNK_SIZE,
            height_query_interval_ms: 25_000,
            socket_timeout_ms: 30_000,
            max_retries: 3,
        }
    }
}

impl Config {
    /// Loads the configuration. A missing file is an error only when a path
    /// was given explicitly.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Config> {
        toml::from_str(text).map_err(|e| LedgerError::Config(format!("Invalid TOML: {e}")))
    }

    /// Applies `NODE_ADDRESS`, `NODE_ID`, `NODE_PEERS` (comma separated),
    /// `MINING` and `DIFFICULTY`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(NODE_ADDRESS_KEY) {
            self.listen_addr = addr;
        }
        if let Some(node_id) = lookup(NODE_ID_KEY) {
            self.node_id = node_id;
        }
        if let Some(peers) = lookup(NODE_PEERS_KEY) {
            self.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(mining) = lookup(MINING_KEY) {
            self.mining_enabled = match mining.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(LedgerError::Config(format!(
                        "{MINING_KEY} must be true or false, got {other}"
                    )))
                }
            };
        }
        if let Some(difficulty) = lookup(DIFFICULTY_KEY) {
            self.difficulty = difficulty.trim().parse().map_err(|e| {
                LedgerError::Config(format!("{DIFFICULTY_KEY} must be a number: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(LedgerError::Config("node_id must not be empty".to_string()));
        }
        if !self.difficulty_policy().is_within_bounds() {
            return Err(LedgerError::Config(format!(
                "difficulty must be between {MIN_DIFFICULTY} and {MAX_DIFFICULTY}"
            )));
        }
        if let Some(adjustment) = &self.difficulty_adjustment {
            if adjustment.period < 2 || adjustment.target_block_time_ms == 0 {
                return Err(LedgerError::Config(
                    "difficulty_adjustment needs period >= 2 and a non-zero target".to_string(),
                ));
            }
        }
        for (name, value) in [
            ("max_records_per_block", self.max_records_per_block),
            ("max_peers", self.max_peers),
            ("chunk_size", self.chunk_size),
        ] {
            if value == 0 {
                return Err(LedgerError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.max_records_per_block > MAX_RECORDS_PER_BLOCK {
            return Err(LedgerError::Config(format!(
                "max_records_per_block must be at most {MAX_RECORDS_PER_BLOCK}"
            )));
        }
        if self.chunk_size > MAX_BLOCKS_PER_RESPONSE {
            return Err(LedgerError::Config(format!(
                "chunk_size must be at most {MAX_BLOCKS_PER_RESPONSE}, peers drop larger responses"
            )));
        }
        if self.height_query_interval_ms == 0
            || self.height_query_interval_ms >= self.socket_timeout_ms
        {
            return Err(LedgerError::Config(
                "height_query_interval_ms must be non-zero and below socket_timeout_ms"
                    .to_string(),
            ));
        }
        self.listen_socket_addr()?;
        self.bootstrap_addrs()?;
        Ok(())
    }

    pub fn difficulty_policy(&self) -> DifficultyPolicy {
        match self.difficulty_adjustment {
            None => DifficultyPolicy::Fixed(self.difficulty),
            Some(adjustment) => DifficultyPolicy::Adjusting {
                initial: self.difficulty,
                period: adjustment.period,
                target_block_time_ms: adjustment.target_block_time_ms,
                min: adjustment.min,
                max: adjustment.max,
            },
        }
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        resolve(&self.listen_addr)
    }

    pub fn bootstrap_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.bootstrap_peers.iter().map(|peer| resolve(peer)).collect()
    }

    pub fn chain_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(CHAIN_FILE))
    }

    pub fn peer_db_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(PEERS_DIR))
    }

    pub fn height_query_interval(&self) -> Duration {
        Duration::from_millis(self.height_query_interval_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Port part of the listen address, e.g. "127.0.0.1:2001" -> "2001".
    pub fn listen_port_label(&self) -> String {
        match self.listen_addr.rsplit(':').next() {
            Some(port) if !port.is_empty() => port.to_string(),
            _ => "default".to_string(),
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| LedgerError::Config(format!("Invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| LedgerError::Config(format!("Address {addr} did not resolve")))
}
