//! The node handle: the one place that locks the ledger. Network sessions,
//! the auto-miner and the binary all go through it.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::blockchain::{Block, Blockchain, HistoryEntry, LedgerError, LedgerState};
use crate::network::{PeerBook, PeerError};
use crate::transaction::Transaction;
use crate::wallet;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("a mining job is already running")]
    AlreadyMining,
    #[error("invalid miner address '{0}'")]
    InvalidAddress(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Local,
    /// Session id the block arrived on.
    Peer(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    BlockAppended {
        index: u64,
        hash: String,
        origin: BlockOrigin,
    },
}

struct Inner {
    ledger: Mutex<Blockchain>,
    mining: AtomicBool,
    events: broadcast::Sender<NodeEvent>,
    peers: PeerBook,
}

/// Cheap to clone; all clones share one ledger.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

/// Clears the mining flag however the job ends.
struct MiningGuard(Arc<Inner>);

impl Drop for MiningGuard {
    fn drop(&mut self) {
        self.0.mining.store(false, Ordering::Release);
    }
}

impl Node {
    pub fn new(ledger: Blockchain, max_peers: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ledger: Mutex::new(ledger),
                mining: AtomicBool::new(false),
                events,
                peers: PeerBook::new(max_peers),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, block: &Block, origin: BlockOrigin) {
        // no subscribers is fine
        let _ = self.inner.events.send(NodeEvent::BlockAppended {
            index: block.index,
            hash: block.hash.clone(),
            origin,
        });
    }

    fn try_start_mining(&self, miner_address: &str) -> Result<MiningGuard, NodeError> {
        if !wallet::is_valid_address(miner_address) {
            return Err(NodeError::InvalidAddress(miner_address.to_string()));
        }
        self.inner
            .mining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| NodeError::AlreadyMining)?;
        Ok(MiningGuard(self.inner.clone()))
    }

    /* -------------------- Writes -------------------- */

    pub fn submit_transaction(&self, tx: Transaction) -> Result<(), NodeError> {
        self.inner.ledger.lock().add_transaction(tx)?;
        Ok(())
    }

    /// Start a background mining job. The candidate is snapshotted now, the
    /// nonce search runs on a blocking worker without the ledger lock, and
    /// the result is committed through `add_block`. The handle yields the
    /// appended block, or `None` when the attempt budget ran out or the tip
    /// moved meanwhile.
    pub fn request_mining(
        &self,
        miner_address: &str,
    ) -> Result<JoinHandle<Option<Block>>, NodeError> {
        let guard = self.try_start_mining(miner_address)?;
        let (mut block, max_attempts) = {
            let ledger = self.inner.ledger.lock();
            (
                ledger.prepare_block(miner_address)?,
                ledger.config().max_mining_attempts,
            )
        };
        info!(
            "Mining block #{} with {} transactions at difficulty {}",
            block.index,
            block.transactions.len(),
            block.difficulty
        );

        let node = self.clone();
        Ok(tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let outcome = block.mine(max_attempts);
            if !outcome.found {
                warn!(
                    "Mining block #{} gave up after {} attempts",
                    block.index, outcome.attempts
                );
                return None;
            }
            node.inner
                .ledger
                .lock()
                .commit_mined_block(block.clone())
                .ok()?;
            node.publish(&block, BlockOrigin::Local);
            Some(block)
        }))
    }

    /// Mine on the calling thread while holding the ledger lock. Tests
    /// only; everything else goes through `request_mining`.
    #[cfg(test)]
    pub(crate) fn mine_now(&self, miner_address: &str) -> Result<Option<Block>, NodeError> {
        let _guard = self.try_start_mining(miner_address)?;
        let mined = self
            .inner
            .ledger
            .lock()
            .mine_pending_transactions(miner_address)?;
        if let Some(block) = &mined {
            self.publish(block, BlockOrigin::Local);
        }
        Ok(mined)
    }

    /// Offer a block received from session `session`.
    pub fn accept_peer_block(&self, block: Block, session: u64) -> Result<(), LedgerError> {
        let (index, hash) = (block.index, block.hash.clone());
        self.inner.ledger.lock().add_block(block)?;
        let _ = self.inner.events.send(NodeEvent::BlockAppended {
            index,
            hash,
            origin: BlockOrigin::Peer(session),
        });
        Ok(())
    }

    /// Call `request_mining` every `every` until the task is aborted. Ticks
    /// that find a job already running are skipped.
    pub fn spawn_auto_miner(&self, miner_address: String, every: Duration) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match node.request_mining(&miner_address) {
                    Ok(job) => match job.await {
                        Ok(Some(block)) => debug!("Auto-miner produced block #{}", block.index),
                        Ok(None) => debug!("Auto-miner round produced no block"),
                        Err(e) => warn!("Mining task failed: {e}"),
                    },
                    Err(NodeError::AlreadyMining) => debug!("Auto-miner tick skipped"),
                    Err(e) => {
                        warn!("Auto-miner stopped: {e}");
                        return;
                    }
                }
            }
        })
    }

    /* -------------------- Reads -------------------- */

    pub fn is_mining(&self) -> bool {
        self.inner.mining.load(Ordering::Acquire)
    }

    pub fn get_chain(&self) -> Vec<Block> {
        self.inner.ledger.lock().chain().to_vec()
    }

    /// Chain length, as advertised in CHAIN_SUMMARY.
    pub fn height(&self) -> u64 {
        self.inner.ledger.lock().len() as u64
    }

    pub fn tip_hash(&self) -> String {
        self.inner
            .ledger
            .lock()
            .tip()
            .map(|b| b.hash.clone())
            .unwrap_or_default()
    }

    pub fn state(&self) -> LedgerState {
        self.inner.ledger.lock().state()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.inner.ledger.lock().pending_transactions().to_vec()
    }

    pub fn contains_block(&self, hash: &str) -> bool {
        self.inner.ledger.lock().contains_block(hash)
    }

    pub fn blocks_from(&self, from: u64, max: usize) -> Vec<Block> {
        self.inner.ledger.lock().blocks_from(from, max)
    }

    pub fn get_balance(&self, address: &str) -> u128 {
        self.inner.ledger.lock().get_balance(address)
    }

    pub fn get_transaction_history(&self, address: &str) -> Vec<HistoryEntry> {
        self.inner.ledger.lock().get_transaction_history(address)
    }

    pub fn is_chain_valid(&self) -> bool {
        self.inner.ledger.lock().is_chain_valid()
    }

    pub fn is_durability_degraded(&self) -> bool {
        self.inner.ledger.lock().is_durability_degraded()
    }

    /* -------------------- Peers -------------------- */

    pub fn peers(&self) -> &PeerBook {
        &self.inner.peers
    }

    pub fn add_peer(&self, url: &str) -> Result<bool, PeerError> {
        let added = self.inner.peers.add(url)?;
        if added {
            info!("Peer {url} added");
        }
        Ok(added)
    }

    pub fn list_peers(&self) -> Vec<String> {
        self.inner.peers.list()
    }

    pub fn remove_peer(&self, url: &str) -> bool {
        let removed = self.inner.peers.remove(url);
        if removed {
            info!("Peer {url} removed");
        }
        removed
    }
}
