use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::error::BlockError;
use super::{GENESIS_TIMESTAMP, MERKLE_EMPTY_MARKER, ZERO_HASH};
use crate::transaction::Transaction;
use crate::wallet::{double_hash, hash};

/// A single block in the blockchain holding a list of transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64, // Unix millis (UTC)
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub merkle_root: String,
    pub difficulty: u32, // leading hex zeros required
    pub nonce: u64,      // Proof-of-Work nonce
    pub hash: String,    // Cached hash of the block
    pub mining_duration_ms: u64,
}

/// Result of a bounded nonce search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MineOutcome {
    pub found: bool,
    pub attempts: u64,
    pub elapsed_ms: u64,
}

impl Block {
    /// The hard-coded first block. Never mined; identical on every node.
    pub fn genesis() -> Self {
        let mut block = Self {
            index: 0,
            timestamp: GENESIS_TIMESTAMP,
            transactions: Vec::new(),
            previous_hash: ZERO_HASH.to_string(),
            merkle_root: String::new(),
            difficulty: 0,
            nonce: 0,
            hash: String::new(),
            mining_duration_ms: 0,
        };
        block.merkle_root = block.compute_merkle_root();
        block.hash = block.calculate_hash();
        block
    }

    /// Create a new block (not mined yet). Call `mine()` to perform PoW.
    pub fn new(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
    ) -> Self {
        let mut block = Self {
            index,
            timestamp: Utc::now().timestamp_millis(),
            transactions,
            previous_hash,
            merkle_root: String::new(),
            difficulty,
            nonce: 0,
            hash: String::new(),
            mining_duration_ms: 0,
        };
        block.merkle_root = block.compute_merkle_root();
        block.hash = block.calculate_hash();
        block
    }

    pub fn transaction_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(Transaction::get_hash).collect()
    }

    /// Pairwise aggregation of transaction hashes; an odd last hash is
    /// paired with itself. Order sensitive.
    pub fn compute_merkle_root(&self) -> String {
        merkle_root(self.transaction_hashes())
    }

    /// Double SHA-256 over (index, timestamp, tx hashes, previous hash,
    /// nonce, merkle root, difficulty). The `hash` field itself is excluded.
    pub fn calculate_hash(&self) -> String {
        let preimage = format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.index,
            self.timestamp,
            self.transaction_hashes().join(","),
            self.previous_hash,
            self.nonce,
            self.merkle_root,
            self.difficulty
        );
        double_hash(preimage.as_bytes())
    }

    /// Search random nonces until the hash has `difficulty` leading hex
    /// zeros or `max_attempts` is spent.
    pub fn mine(&mut self, max_attempts: u64) -> MineOutcome {
        let started = Instant::now();
        // transaction hashes do not depend on the nonce; compute them once
        let tx_hashes = self.transaction_hashes().join(",");
        let mut attempts = 0;
        let mut found = false;

        while attempts < max_attempts {
            attempts += 1;
            self.nonce = rand::random::<u64>();
            let preimage = format!(
                "{}:{}:{}:{}:{}:{}:{}",
                self.index,
                self.timestamp,
                tx_hashes,
                self.previous_hash,
                self.nonce,
                self.merkle_root,
                self.difficulty
            );
            let candidate = double_hash(preimage.as_bytes());
            if meets_difficulty(&candidate, self.difficulty) {
                self.hash = candidate;
                found = true;
                break;
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.mining_duration_ms = elapsed_ms;
        MineOutcome {
            found,
            attempts,
            elapsed_ms,
        }
    }

    /// Full self-check, reporting the first failing rule.
    /// Does NOT validate chain linkage.
    pub fn validate(&self) -> Result<(), BlockError> {
        if self.timestamp <= 0 {
            return Err(BlockError::InvalidTimestamp(self.timestamp));
        }
        let expected_root = self.compute_merkle_root();
        if self.merkle_root != expected_root {
            return Err(BlockError::MerkleMismatch);
        }
        let expected = self.calculate_hash();
        if self.hash != expected {
            return Err(BlockError::HashMismatch {
                stored: self.hash.clone(),
                computed: expected,
            });
        }
        if !meets_difficulty(&self.hash, self.difficulty) {
            return Err(BlockError::InsufficientWork {
                difficulty: self.difficulty,
            });
        }

        let mut system_issued = 0;
        for (position, tx) in self.transactions.iter().enumerate() {
            if tx.is_system_issued() {
                system_issued += 1;
                if system_issued > 1 {
                    return Err(BlockError::MultipleSystemTransactions);
                }
            }
            if !tx.is_valid() {
                return Err(BlockError::InvalidTransaction {
                    position,
                    id: tx.id().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// The single system-issued transaction, if the block carries one.
    pub fn reward(&self) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.is_system_issued())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Merkle root over already computed hashes.
pub fn merkle_root(mut level: Vec<String>) -> String {
    if level.is_empty() {
        return hash(MERKLE_EMPTY_MARKER.as_bytes());
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| hash(format!("{}{}", pair[0], pair[1]).as_bytes()))
            .collect();
    }
    level.swap_remove(0)
}

/// True when `hash` starts with at least `difficulty` '0' characters.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let run = hash.chars().take_while(|c| *c == '0').count();
    run >= difficulty as usize
}
