use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::blockchain::{
    DEFAULT_BLOCK_SIZE, DEFAULT_DIFFICULTY, DEFAULT_MAX_MINING_ATTEMPTS, DEFAULT_MINING_REWARD,
    LedgerConfig,
};
use crate::network::{DEFAULT_NETWORK_ID, NetworkConfig};
use crate::wallet;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Everything the binary needs, read from the environment.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub ledger: LedgerConfig,
    pub network: NetworkConfig,
    pub data_dir: PathBuf,
    /// Enables the auto-miner when set.
    pub miner_address: Option<String>,
    pub mine_interval: Duration,
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, var, default).map(Duration::from_secs)
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let ledger = LedgerConfig {
            difficulty: parse_or(&lookup, "DIFFICULTY", DEFAULT_DIFFICULTY)?,
            mining_reward: parse_or(&lookup, "MINING_REWARD", DEFAULT_MINING_REWARD)?,
            block_size: parse_or(&lookup, "BLOCK_SIZE", DEFAULT_BLOCK_SIZE)?,
            max_mining_attempts: parse_or(
                &lookup,
                "MAX_MINING_ATTEMPTS",
                DEFAULT_MAX_MINING_ATTEMPTS,
            )?,
        };

        let host = lookup("P2P_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = parse_or(&lookup, "P2P_PORT", 6001)?;
        let bootstrap_peers = lookup("BOOTSTRAP_PEERS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let network = NetworkConfig {
            listen_addr: format!("{host}:{port}"),
            advertise_addr: None,
            node_id: lookup("NODE_ID").unwrap_or_else(|| Uuid::new_v4().to_string()),
            network_id: lookup("NETWORK_ID").unwrap_or_else(|| DEFAULT_NETWORK_ID.to_string()),
            bootstrap_peers,
            max_peers: parse_or(&lookup, "MAX_PEERS", 8)?,
            heartbeat_interval: secs_or(&lookup, "HEARTBEAT_INTERVAL_SECS", 10)?,
            liveness_timeout: secs_or(&lookup, "LIVENESS_TIMEOUT_SECS", 30)?,
            connect_timeout: secs_or(&lookup, "CONNECT_TIMEOUT_SECS", 5)?,
            sync_batch: parse_or(&lookup, "SYNC_BATCH", 50)?,
        };

        let miner_address = match lookup("MINER_ADDRESS") {
            Some(addr) if !wallet::is_valid_address(&addr) => {
                return Err(ConfigError::Invalid {
                    var: "MINER_ADDRESS",
                    value: addr,
                });
            }
            other => other,
        };

        Ok(Self {
            ledger,
            network,
            data_dir: lookup("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            miner_address,
            mine_interval: secs_or(&lookup, "MINE_INTERVAL_SECS", 30)?,
        })
    }
}
