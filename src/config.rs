//! Node configuration from environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::blockchain::{Address, ChainConfig, MiningPolicy};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:6001";
pub const DEFAULT_DIFFICULTY: u32 = 2;
pub const DEFAULT_MINING_REWARD: f64 = 50.0;
pub const DEFAULT_BLOCK_TIME_MS: u64 = 10_000;

/// Errors that can occur while reading configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Settings for a single ledger node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Sled directory; `None` keeps state in memory
    pub data_dir: Option<PathBuf>,
    pub listen_addr: SocketAddr,
    /// Peers dialed at startup (`host:port`)
    pub peers: Vec<String>,
    /// Mining is enabled when set
    pub miner_address: Option<Address>,
    pub difficulty: u32,
    pub mining_reward: f64,
    pub expected_block_time_ms: u64,
    pub mining_deadline: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: None,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 6001)),
            peers: Vec::new(),
            miner_address: None,
            difficulty: DEFAULT_DIFFICULTY,
            mining_reward: DEFAULT_MINING_REWARD,
            expected_block_time_ms: DEFAULT_BLOCK_TIME_MS,
            mining_deadline: None,
        }
    }
}

impl NodeConfig {
    /// Reads the configuration from the process environment
    ///
    /// # Environment Variables
    ///
    /// - `LEDGER_DATA_DIR`: sled directory (default: in-memory)
    /// - `LEDGER_LISTEN_ADDR`: sync listener (default: 127.0.0.1:6001)
    /// - `LEDGER_PEERS`: comma-separated `host:port` list
    /// - `LEDGER_MINER_ADDRESS`: reward address, enables mining
    /// - `LEDGER_DIFFICULTY`: initial difficulty (default: 2)
    /// - `LEDGER_MINING_REWARD`: reward per block (default: 50)
    /// - `LEDGER_BLOCK_TIME_MS`: expected block time (default: 10000)
    /// - `LEDGER_MINING_DEADLINE_MS`: per-candidate search deadline (default: none)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a key to its value
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = NodeConfig::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let peers = value("LEDGER_PEERS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|peer| !peer.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let difficulty = parse(&value, "LEDGER_DIFFICULTY")?.unwrap_or(defaults.difficulty);
        if difficulty == 0 {
            return Err(invalid("LEDGER_DIFFICULTY", "0"));
        }

        let mining_reward =
            parse(&value, "LEDGER_MINING_REWARD")?.unwrap_or(defaults.mining_reward);
        if !mining_reward.is_finite() || mining_reward <= 0.0 {
            return Err(invalid("LEDGER_MINING_REWARD", &mining_reward.to_string()));
        }

        Ok(NodeConfig {
            data_dir: value("LEDGER_DATA_DIR").map(PathBuf::from),
            listen_addr: parse(&value, "LEDGER_LISTEN_ADDR")?.unwrap_or(defaults.listen_addr),
            peers,
            miner_address: value("LEDGER_MINER_ADDRESS").map(|a| Address(a.trim().to_string())),
            difficulty,
            mining_reward,
            expected_block_time_ms: parse(&value, "LEDGER_BLOCK_TIME_MS")?
                .unwrap_or(defaults.expected_block_time_ms),
            mining_deadline: parse(&value, "LEDGER_MINING_DEADLINE_MS")?
                .map(Duration::from_millis),
        })
    }

    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            difficulty: self.difficulty,
            mining_reward: self.mining_reward,
        }
    }

    pub fn mining_policy(&self) -> MiningPolicy {
        MiningPolicy {
            max_attempts: None,
            deadline: self.mining_deadline,
        }
    }
}

fn parse<T, F>(value: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match value(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &raw)),
        None => Ok(None),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}
