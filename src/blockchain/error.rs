use thiserror::Error;

/// Why a block failed its self-check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("timestamp {0} is not positive")]
    InvalidTimestamp(i64),
    #[error("merkle root does not match transactions")]
    MerkleMismatch,
    #[error("stored hash {stored} != computed {computed}")]
    HashMismatch { stored: String, computed: String },
    #[error("hash does not meet difficulty {difficulty}")]
    InsufficientWork { difficulty: u32 },
    #[error("more than one system-issued transaction")]
    MultipleSystemTransactions,
    #[error("transaction {id} at position {position} is invalid")]
    InvalidTransaction { position: usize, id: String },
}

/// Rejections at the ledger boundary. The chain is unchanged whenever one
/// of these is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("invalid transaction {0}")]
    InvalidTransaction(String),
    #[error("insufficient balance for {address}: has {balance}, needs {required}")]
    InsufficientBalance {
        address: String,
        balance: u128,
        required: u128,
    },
    #[error("double spend by {address}: {pending} pending + {required} requested > {confirmed} confirmed")]
    DoubleSpend {
        address: String,
        confirmed: u128,
        pending: u128,
        required: u128,
    },
    #[error("transaction {0} already known")]
    DuplicateTransaction(String),
    #[error("system-issued transactions are created by the ledger only")]
    SystemIssuedRejected,
    #[error("invalid block #{index}: {source}")]
    InvalidBlock { index: u64, source: BlockError },
    #[error("chain already has a genesis block")]
    GenesisAlreadyPresent,
    #[error("genesis block does not match the canonical genesis")]
    InvalidGenesis,
    #[error("block #{got} does not extend tip, expected #{expected}")]
    IndexGap { expected: u64, got: u64 },
    #[error("block #{got} is at or below tip #{tip}")]
    StaleBlock { tip: u64, got: u64 },
    #[error("previous hash of block #{index} does not match tip")]
    PreviousHashMismatch { index: u64 },
    #[error("block #{index} reward must be exactly {expected}")]
    InvalidReward { index: u64, expected: u64 },
    #[error("block #{index} difficulty {got} below required {required}")]
    DifficultyTooLow { index: u64, got: u32, required: u32 },
    #[error("ledger has no genesis block")]
    Uninitialized,
}
