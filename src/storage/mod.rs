//! Durable ledger state on sled.
//!
//! One tree, `ledger`, with two fixed keys:
//!
//! | Key       | Value                          |
//! |-----------|--------------------------------|
//! | `chain`   | JSON array of blocks           |
//! | `pending` | JSON array of transactions     |
//!
//! Both records are written in a single `Batch` so a reader never sees a
//! chain from one mutation paired with the pending pool of another.

use sled::{Batch, Db, Tree};
use std::path::Path;
use thiserror::Error;

use crate::blockchain::Block;
use crate::transaction::Transaction;

const TREE_NAME: &str = "ledger";
const KEY_CHAIN: &[u8] = b"chain";
const KEY_PENDING: &[u8] = b"pending";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct LedgerStore {
    db: Db,
    tree: Tree,
}

impl LedgerStore {
    /// Open or create a store in `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store, dropped with the handle. For tests.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    /// Write chain and pending pool atomically, then flush.
    pub fn save_state(&self, chain: &[Block], pending: &[Transaction]) -> StoreResult<()> {
        let mut batch = Batch::default();
        batch.insert(KEY_CHAIN, serde_json::to_vec(chain)?);
        batch.insert(KEY_PENDING, serde_json::to_vec(pending)?);
        self.tree.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn save_pending(&self, pending: &[Transaction]) -> StoreResult<()> {
        self.tree.insert(KEY_PENDING, serde_json::to_vec(pending)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// `None` when nothing has been persisted yet.
    pub fn load_chain(&self) -> StoreResult<Option<Vec<Block>>> {
        match self.tree.get(KEY_CHAIN)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load_pending(&self) -> StoreResult<Vec<Transaction>> {
        match self.tree.get(KEY_PENDING)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn get_raw(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }
}
