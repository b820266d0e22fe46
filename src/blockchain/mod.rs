pub mod block;
pub mod error;
pub mod model;

pub use block::{Block, MineOutcome};
pub use error::{BlockError, LedgerError};
pub use model::{Blockchain, HistoryEntry, LedgerConfig, LedgerState};

/// Default Proof-of-Work difficulty (number of leading zeros).
pub const DEFAULT_DIFFICULTY: u32 = 3;

/// Amount paid to the miner of each block.
pub const DEFAULT_MINING_REWARD: u64 = 100;

/// Max transactions per block, reward included.
pub const DEFAULT_BLOCK_SIZE: usize = 10;

/// Nonce attempts before a mining job gives up.
pub const DEFAULT_MAX_MINING_ATTEMPTS: u64 = 5_000_000;

/// previous_hash of the genesis block.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// 2024-01-01T00:00:00Z, shared by every node's genesis.
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200_000;

/// Hashed to form the Merkle root of an empty block.
pub const MERKLE_EMPTY_MARKER: &str = "EMPTY";
