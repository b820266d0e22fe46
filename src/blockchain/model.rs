use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use super::error::LedgerError;
use super::{
    Block, DEFAULT_BLOCK_SIZE, DEFAULT_DIFFICULTY, DEFAULT_MAX_MINING_ATTEMPTS,
    DEFAULT_MINING_REWARD, ZERO_HASH,
};
use crate::storage::LedgerStore;
use crate::transaction::Transaction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub difficulty: u32,
    pub mining_reward: u64,
    pub block_size: usize,
    pub max_mining_attempts: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            mining_reward: DEFAULT_MINING_REWARD,
            block_size: DEFAULT_BLOCK_SIZE,
            max_mining_attempts: DEFAULT_MAX_MINING_ATTEMPTS,
        }
    }
}

/// Where the chain tip stands. There is no way back: blocks are never
/// reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Empty,
    Initialized,
    Growing,
}

/// A transaction touching an address, confirmed or still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub transaction: Transaction,
    pub confirmed: bool,
    pub block_index: Option<u64>,
}

/// The ledger: sole owner of the chain and the pending pool.
#[derive(Debug)]
pub struct Blockchain {
    chain: Vec<Block>,
    pending: Vec<Transaction>,
    config: LedgerConfig,
    store: Option<LedgerStore>,
    durability_degraded: bool,
}

impl Blockchain {
    /// In-memory ledger starting at genesis.
    pub fn new(config: LedgerConfig) -> Self {
        let mut bc = Self::empty(config);
        bc.chain.push(Block::genesis());
        bc
    }

    /// In-memory ledger with no genesis yet. `add_block(Block::genesis())`
    /// moves it to `Initialized`.
    pub fn empty(config: LedgerConfig) -> Self {
        Self {
            chain: Vec::new(),
            pending: Vec::new(),
            config,
            store: None,
            durability_degraded: false,
        }
    }

    /// Load prior state from `store`, or start from genesis when there is
    /// none (or it cannot be trusted). Every later mutation is persisted.
    /// A store that cannot be read is not attached at all.
    pub fn open(config: LedgerConfig, store: LedgerStore) -> Self {
        let mut bc = Self::empty(config);

        match store.load_chain() {
            Ok(Some(chain)) => {
                bc.chain = chain;
                if bc.is_chain_valid() {
                    match store.load_pending() {
                        Ok(pending) => bc.pending = pending,
                        Err(e) => warn!("Discarding unreadable pending pool: {e}"),
                    }
                    info!(
                        "Loaded chain of {} blocks ({} pending txs)",
                        bc.chain.len(),
                        bc.pending.len()
                    );
                } else {
                    warn!("Persisted chain failed validation; starting from genesis");
                    bc.chain = vec![Block::genesis()];
                }
            }
            Ok(None) => {
                info!("No persisted chain; starting from genesis");
                bc.chain.push(Block::genesis());
            }
            Err(e) => {
                // leave the stored record alone, it may still be recoverable
                error!(
                    "Could not load ledger state: {e}; running from genesis in memory, store detached"
                );
                bc.chain.push(Block::genesis());
                bc.durability_degraded = true;
                return bc;
            }
        }

        bc.store = Some(store);
        bc.persist_state();
        bc
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn state(&self) -> LedgerState {
        match self.chain.len() {
            0 => LedgerState::Empty,
            1 => LedgerState::Initialized,
            _ => LedgerState::Growing,
        }
    }

    /// Read-only view of the chain.
    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Return the last block in the chain.
    pub fn tip(&self) -> Option<&Block> {
        self.chain.last()
    }

    pub fn pending_transactions(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn contains_block(&self, hash: &str) -> bool {
        self.chain.iter().any(|b| b.hash == hash)
    }

    /// Up to `max` blocks starting at index `from`.
    pub fn blocks_from(&self, from: u64, max: usize) -> Vec<Block> {
        self.chain
            .iter()
            .skip(from as usize)
            .take(max)
            .cloned()
            .collect()
    }

    pub fn is_durability_degraded(&self) -> bool {
        self.durability_degraded
    }

    /* -------------------- Balances -------------------- */

    fn confirmed_totals(&self, address: &str) -> (u128, u128) {
        let (mut credits, mut debits) = (0u128, 0u128);
        for tx in self.chain.iter().flat_map(|b| b.transactions.iter()) {
            if tx.sender() == address {
                debits += tx.total_cost();
            }
            if tx.recipient() == address {
                credits += tx.amount() as u128;
            }
        }
        (credits, debits)
    }

    /// Balance from mined blocks only.
    pub fn confirmed_balance(&self, address: &str) -> u128 {
        let (credits, debits) = self.confirmed_totals(address);
        credits.saturating_sub(debits)
    }

    /// Amount plus fee of everything `address` has pending.
    pub fn pending_spends(&self, address: &str) -> u128 {
        self.pending
            .iter()
            .filter(|tx| tx.sender() == address)
            .map(Transaction::total_cost)
            .sum()
    }

    /// Full rescan of the chain plus the pending pool.
    pub fn get_balance(&self, address: &str) -> u128 {
        let (mut credits, mut debits) = self.confirmed_totals(address);
        for tx in &self.pending {
            if tx.sender() == address {
                debits += tx.total_cost();
            }
            if tx.recipient() == address {
                credits += tx.amount() as u128;
            }
        }
        credits.saturating_sub(debits)
    }

    /// Transactions sent or received by `address`, newest first.
    pub fn get_transaction_history(&self, address: &str) -> Vec<HistoryEntry> {
        let touches = &|tx: &Transaction| tx.sender() == address || tx.recipient() == address;

        let mut entries: Vec<HistoryEntry> = self
            .chain
            .iter()
            .flat_map(|b| {
                b.transactions
                    .iter()
                    .filter(move |&tx| touches(tx))
                    .map(move |tx| HistoryEntry {
                        transaction: tx.clone(),
                        confirmed: true,
                        block_index: Some(b.index),
                    })
            })
            .chain(
                self.pending
                    .iter()
                    .filter(move |&tx| touches(tx))
                    .map(|tx| HistoryEntry {
                        transaction: tx.clone(),
                        confirmed: false,
                        block_index: None,
                    }),
            )
            .collect();

        // newest first; pending before confirmed on equal timestamps
        entries.sort_by(|a, b| {
            b.transaction
                .timestamp()
                .cmp(&a.transaction.timestamp())
                .then(a.confirmed.cmp(&b.confirmed))
        });
        entries
    }

    /* -------------------- Pending pool -------------------- */

    fn is_known_transaction(&self, id: &str) -> bool {
        self.pending.iter().any(|tx| tx.id() == id)
            || self
                .chain
                .iter()
                .flat_map(|b| b.transactions.iter())
                .any(|tx| tx.id() == id)
    }

    /// Validate and queue a user transaction.
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), LedgerError> {
        if tx.is_system_issued() {
            return Err(LedgerError::SystemIssuedRejected);
        }
        if !tx.is_valid() {
            return Err(LedgerError::InvalidTransaction(tx.id().to_string()));
        }
        if self.is_known_transaction(tx.id()) {
            return Err(LedgerError::DuplicateTransaction(tx.id().to_string()));
        }

        let sender = tx.sender().to_string();
        let required = tx.total_cost();
        let confirmed = self.confirmed_balance(&sender);
        if confirmed < required {
            return Err(LedgerError::InsufficientBalance {
                address: sender,
                balance: confirmed,
                required,
            });
        }
        let pending = self.pending_spends(&sender);
        if pending + required > confirmed {
            return Err(LedgerError::DoubleSpend {
                address: sender,
                confirmed,
                pending,
                required,
            });
        }

        debug!(
            "Accepted tx {} into pending pool (size: {} -> {})",
            tx.id(),
            self.pending.len(),
            self.pending.len() + 1
        );
        self.pending.push(tx);
        self.persist_pending();
        Ok(())
    }

    /* -------------------- Mining -------------------- */

    /// Unmined candidate on top of the tip: a snapshot of pending
    /// transactions followed by the reward. The pending pool is untouched.
    pub fn prepare_block(&self, miner_address: &str) -> Result<Block, LedgerError> {
        let tip = self.tip().ok_or(LedgerError::Uninitialized)?;
        let reward = Transaction::system_reward(miner_address, self.config.mining_reward)
            .map_err(|e| LedgerError::InvalidTransaction(e.to_string()))?;

        let room = self.config.block_size.saturating_sub(1);
        let mut txs: Vec<Transaction> = self.pending.iter().take(room).cloned().collect();
        txs.push(reward);

        Ok(Block::new(
            tip.index + 1,
            tip.hash.clone(),
            txs,
            self.config.difficulty,
        ))
    }

    /// Build, mine and append a block in one go. `Ok(None)` when the
    /// attempt budget ran out; the pending pool is then left as it was.
    pub fn mine_pending_transactions(
        &mut self,
        miner_address: &str,
    ) -> Result<Option<Block>, LedgerError> {
        let mut block = self.prepare_block(miner_address)?;
        let outcome = block.mine(self.config.max_mining_attempts);
        if !outcome.found {
            warn!(
                "Mining block #{} gave up after {} attempts",
                block.index, outcome.attempts
            );
            return Ok(None);
        }
        self.commit_mined_block(block.clone())?;
        Ok(Some(block))
    }

    /// Append a block produced from `prepare_block`. Goes through the same
    /// gate as peer blocks; a tip that moved while mining yields
    /// `StaleBlock` or `PreviousHashMismatch`.
    pub fn commit_mined_block(&mut self, block: Block) -> Result<(), LedgerError> {
        let index = block.index;
        self.add_block(block).inspect_err(|e| {
            warn!("Discarding mined block #{index}: {e}");
        })
    }

    /* -------------------- Chain growth -------------------- */

    /// The single gate for chain growth. All-or-nothing.
    pub fn add_block(&mut self, block: Block) -> Result<(), LedgerError> {
        if block.index == 0 {
            self.check_genesis(&block)?;
        } else {
            self.check_extends_tip(&block)?;
        }

        info!(
            "Appended block #{} hash={} txs={} ({} ms)",
            block.index,
            block.hash,
            block.transactions.len(),
            block.mining_duration_ms
        );

        let included: HashSet<&str> = block.transactions.iter().map(|t| t.id()).collect();
        let before = self.pending.len();
        self.pending.retain(|t| !included.contains(t.id()));
        debug!("Pending pool cleaned: {} -> {}", before, self.pending.len());

        self.chain.push(block);
        self.revalidate_pending();
        self.persist_state();
        Ok(())
    }

    /// Drop pending transactions the new confirmed balances no longer
    /// cover, in pool order. A peer block can confirm a different spend by
    /// the same sender.
    fn revalidate_pending(&mut self) {
        let mut remaining: HashMap<String, u128> = HashMap::new();
        let mut kept = Vec::with_capacity(self.pending.len());
        for tx in std::mem::take(&mut self.pending) {
            let available = remaining
                .entry(tx.sender().to_string())
                .or_insert_with(|| self.confirmed_balance(tx.sender()));
            let cost = tx.total_cost();
            if cost > *available {
                warn!(
                    "Dropping pending tx {} from {}: needs {cost}, {} left after block",
                    tx.id(),
                    tx.sender(),
                    *available
                );
                continue;
            }
            *available -= cost;
            kept.push(tx);
        }
        self.pending = kept;
    }

    fn check_genesis(&self, block: &Block) -> Result<(), LedgerError> {
        if !self.chain.is_empty() {
            return Err(LedgerError::GenesisAlreadyPresent);
        }
        if block.previous_hash != ZERO_HASH || block.hash != Block::genesis().hash {
            return Err(LedgerError::InvalidGenesis);
        }
        block.validate().map_err(|source| LedgerError::InvalidBlock {
            index: 0,
            source,
        })
    }

    fn check_extends_tip(&self, block: &Block) -> Result<(), LedgerError> {
        let tip = self.tip().ok_or(LedgerError::Uninitialized)?;
        if block.index <= tip.index {
            return Err(LedgerError::StaleBlock {
                tip: tip.index,
                got: block.index,
            });
        }
        if block.index != tip.index + 1 {
            return Err(LedgerError::IndexGap {
                expected: tip.index + 1,
                got: block.index,
            });
        }
        if block.previous_hash != tip.hash {
            return Err(LedgerError::PreviousHashMismatch { index: block.index });
        }
        if block.difficulty < self.config.difficulty {
            return Err(LedgerError::DifficultyTooLow {
                index: block.index,
                got: block.difficulty,
                required: self.config.difficulty,
            });
        }
        block.validate().map_err(|source| LedgerError::InvalidBlock {
            index: block.index,
            source,
        })?;

        if let Some(reward) = block.reward() {
            if reward.amount() != self.config.mining_reward {
                return Err(LedgerError::InvalidReward {
                    index: block.index,
                    expected: self.config.mining_reward,
                });
            }
        }

        self.check_block_spends(block)
    }

    /// A block from a peer must not confirm duplicates or overspend.
    fn check_block_spends(&self, block: &Block) -> Result<(), LedgerError> {
        let mut seen = HashSet::new();
        let mut spends: HashMap<&str, u128> = HashMap::new();
        for tx in &block.transactions {
            if !seen.insert(tx.id())
                || self
                    .chain
                    .iter()
                    .flat_map(|b| b.transactions.iter())
                    .any(|t| t.id() == tx.id())
            {
                return Err(LedgerError::DuplicateTransaction(tx.id().to_string()));
            }
            if !tx.is_system_issued() {
                *spends.entry(tx.sender()).or_default() += tx.total_cost();
            }
        }
        for (address, required) in spends {
            let balance = self.confirmed_balance(address);
            if balance < required {
                return Err(LedgerError::InsufficientBalance {
                    address: address.to_string(),
                    balance,
                    required,
                });
            }
        }
        Ok(())
    }

    /// Validate the entire chain: genesis, linkage, continuity, hashes, PoW.
    pub fn is_chain_valid(&self) -> bool {
        let Some(genesis) = self.chain.first() else {
            return false;
        };
        if genesis.index != 0
            || genesis.previous_hash != ZERO_HASH
            || genesis.hash != Block::genesis().hash
            || !genesis.is_valid()
        {
            return false;
        }

        self.chain.windows(2).all(|pair| {
            let (prev, current) = (&pair[0], &pair[1]);
            current.index == prev.index + 1
                && current.previous_hash == prev.hash
                && current.is_valid()
        })
    }

    /* -------------------- Persistence -------------------- */

    fn persist_state(&mut self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_state(&self.chain, &self.pending) {
                error!("Failed to persist ledger state (durability degraded): {e}");
                self.durability_degraded = true;
            }
        }
    }

    fn persist_pending(&mut self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_pending(&self.pending) {
                error!("Failed to persist pending pool (durability degraded): {e}");
                self.durability_degraded = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::BlockError;
    use crate::transaction::{SupplyAction, SupplyPayload};
    use crate::wallet::Wallet;

    fn test_config() -> LedgerConfig {
        LedgerConfig {
            difficulty: 1,
            mining_reward: 100,
            block_size: 10,
            max_mining_attempts: 1_000_000,
        }
    }

    fn transfer(from: &Wallet, to: &Wallet, amount: u64, fee: u64) -> Transaction {
        Transaction::new(
            &from.address,
            &to.address,
            amount,
            fee,
            SupplyPayload::new("LOT-100").with("product", "amoxicillin"),
            SupplyAction::Shipped,
        )
        .unwrap()
        .sign(&from.private_key)
        .unwrap()
    }

    /// Ledger where `funded` already has one confirmed reward.
    fn funded_ledger(funded: &Wallet) -> Blockchain {
        let mut bc = Blockchain::new(test_config());
        bc.mine_pending_transactions(&funded.address)
            .unwrap()
            .expect("block mined");
        bc
    }

    #[test]
    fn genesis_only_chain_is_valid() {
        let bc = Blockchain::new(test_config());
        assert_eq!(bc.len(), 1);
        assert_eq!(bc.state(), LedgerState::Initialized);
        assert!(bc.is_chain_valid());
        let g = bc.tip().unwrap();
        assert_eq!(g.index, 0);
        assert_eq!(g.previous_hash, "0".repeat(64));
        assert!(g.transactions.is_empty());
    }

    #[test]
    fn state_machine_moves_forward() {
        let mut bc = Blockchain::empty(test_config());
        assert_eq!(bc.state(), LedgerState::Empty);
        assert!(!bc.is_chain_valid());
        bc.add_block(Block::genesis()).unwrap();
        assert_eq!(bc.state(), LedgerState::Initialized);
        let miner = Wallet::generate();
        bc.mine_pending_transactions(&miner.address).unwrap();
        assert_eq!(bc.state(), LedgerState::Growing);
    }

    #[test]
    fn second_genesis_is_rejected() {
        let mut bc = Blockchain::new(test_config());
        assert_eq!(
            bc.add_block(Block::genesis()),
            Err(LedgerError::GenesisAlreadyPresent)
        );
        assert_eq!(bc.len(), 1);
    }

    #[test]
    fn foreign_genesis_is_rejected() {
        let mut bc = Blockchain::empty(test_config());
        let mut fake = Block::new(0, ZERO_HASH.to_string(), vec![], 0);
        fake.timestamp = 42;
        fake.hash = fake.calculate_hash();
        assert_eq!(bc.add_block(fake), Err(LedgerError::InvalidGenesis));
        assert!(bc.is_empty());
    }

    #[test]
    fn mining_pays_reward_and_links() {
        let miner = Wallet::generate();
        let mut bc = Blockchain::new(LedgerConfig {
            difficulty: 4,
            max_mining_attempts: 20_000_000,
            ..test_config()
        });
        let block = bc.mine_pending_transactions(&miner.address).unwrap().unwrap();

        assert!(block.is_valid());
        assert!(block.hash.starts_with("0000"));
        let reward = block.reward().unwrap();
        assert_eq!(reward.amount(), 100);
        assert_eq!(reward.recipient(), miner.address);
        assert_eq!(bc.get_balance(&miner.address), 100);
        assert_eq!(bc.chain()[1].previous_hash, bc.chain()[0].hash);
        assert!(bc.is_chain_valid());
    }

    #[test]
    fn difficulty_four_with_one_transaction() {
        let (a, b) = (Wallet::generate(), Wallet::generate());
        let mut bc = Blockchain::new(LedgerConfig {
            difficulty: 4,
            max_mining_attempts: 20_000_000,
            ..test_config()
        });
        bc.mine_pending_transactions(&a.address).unwrap().unwrap();
        bc.add_transaction(transfer(&a, &b, 30, 1)).unwrap();

        let block = bc.mine_pending_transactions(&a.address).unwrap().unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert!(block.is_valid());
        assert_eq!(block.reward().unwrap().amount(), 100);
        assert!(bc.pending_transactions().is_empty());
        assert_eq!(bc.get_balance(&b.address), 30);
        assert_eq!(bc.get_balance(&a.address), 100 - 31 + 100);
    }

    #[test]
    fn double_spend_across_pending_pool_is_rejected() {
        let (a, b, c) = (Wallet::generate(), Wallet::generate(), Wallet::generate());
        let mut bc = funded_ledger(&a);
        assert_eq!(bc.confirmed_balance(&a.address), 100);

        bc.add_transaction(transfer(&a, &b, 60, 1)).unwrap();
        let err = bc.add_transaction(transfer(&a, &c, 50, 1)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::DoubleSpend {
                address: a.address.clone(),
                confirmed: 100,
                pending: 61,
                required: 51,
            }
        );
        assert_eq!(bc.pending_transactions().len(), 1);
        assert!(bc.pending_spends(&a.address) <= bc.confirmed_balance(&a.address));
    }

    #[test]
    fn insufficient_balance_is_rejected() {
        let (a, b) = (Wallet::generate(), Wallet::generate());
        let mut bc = Blockchain::new(test_config());
        let err = bc.add_transaction(transfer(&a, &b, 1, 0)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { balance: 0, required: 1, .. }));
    }

    #[test]
    fn invalid_and_duplicate_transactions_are_rejected() {
        let (a, b) = (Wallet::generate(), Wallet::generate());
        let mut bc = funded_ledger(&a);

        let unsigned = Transaction::new(
            &a.address,
            &b.address,
            1,
            0,
            SupplyPayload::new("LOT-1"),
            SupplyAction::Produced,
        )
        .unwrap();
        assert!(matches!(
            bc.add_transaction(unsigned),
            Err(LedgerError::InvalidTransaction(_))
        ));

        let tx = transfer(&a, &b, 1, 0);
        bc.add_transaction(tx.clone()).unwrap();
        assert!(matches!(
            bc.add_transaction(tx),
            Err(LedgerError::DuplicateTransaction(_))
        ));

        let reward = Transaction::system_reward(&b.address, 100).unwrap();
        assert_eq!(
            bc.add_transaction(reward),
            Err(LedgerError::SystemIssuedRejected)
        );
    }

    #[test]
    fn failed_mining_leaves_pending_untouched() {
        let (a, b) = (Wallet::generate(), Wallet::generate());
        let mut bc = funded_ledger(&a);
        bc.add_transaction(transfer(&a, &b, 10, 0)).unwrap();

        bc.config.difficulty = 64;
        bc.config.max_mining_attempts = 10;
        assert_eq!(bc.mine_pending_transactions(&a.address).unwrap(), None);
        assert_eq!(bc.pending_transactions().len(), 1);
        assert_eq!(bc.len(), 2);
    }

    #[test]
    fn block_size_caps_snapshot() {
        let (a, b) = (Wallet::generate(), Wallet::generate());
        let mut bc = funded_ledger(&a);
        bc.config.block_size = 3;
        for _ in 0..4 {
            bc.add_transaction(transfer(&a, &b, 1, 0)).unwrap();
        }
        let block = bc.mine_pending_transactions(&a.address).unwrap().unwrap();
        assert_eq!(block.transactions.len(), 3);
        assert!(block.transactions.last().unwrap().is_system_issued());
        assert_eq!(bc.pending_transactions().len(), 2);
    }

    #[test]
    fn add_block_rejects_gap_and_bad_link() {
        let miner = Wallet::generate();
        let mut source = Blockchain::new(test_config());
        for _ in 0..3 {
            source.mine_pending_transactions(&miner.address).unwrap();
        }

        let mut bc = Blockchain::new(test_config());
        let gap = source.chain()[2].clone();
        assert_eq!(
            bc.add_block(gap),
            Err(LedgerError::IndexGap { expected: 1, got: 2 })
        );

        let mut wrong_parent = bc.prepare_block(&miner.address).unwrap();
        wrong_parent.previous_hash = "f".repeat(64);
        wrong_parent.mine(1_000_000);
        assert_eq!(
            bc.add_block(wrong_parent),
            Err(LedgerError::PreviousHashMismatch { index: 1 })
        );

        bc.add_block(source.chain()[1].clone()).unwrap();
        assert_eq!(
            bc.add_block(source.chain()[1].clone()),
            Err(LedgerError::StaleBlock { tip: 1, got: 1 })
        );
        assert_eq!(bc.len(), 2);
    }

    #[test]
    fn add_block_rejects_unmined_and_low_difficulty() {
        let miner = Wallet::generate();
        let mut bc = Blockchain::new(LedgerConfig {
            difficulty: 3,
            ..test_config()
        });
        let unmined = bc.prepare_block(&miner.address).unwrap();
        let mut tampered = unmined.clone();
        tampered.hash = "f".repeat(64);
        assert!(matches!(
            bc.add_block(tampered),
            Err(LedgerError::InvalidBlock {
                source: BlockError::HashMismatch { .. },
                ..
            })
        ));

        let mut easy = unmined;
        easy.difficulty = 0;
        easy.hash = easy.calculate_hash();
        assert!(matches!(
            bc.add_block(easy),
            Err(LedgerError::DifficultyTooLow { got: 0, required: 3, .. })
        ));
        assert_eq!(bc.len(), 1);
    }

    #[test]
    fn add_block_rejects_inflated_reward() {
        let miner = Wallet::generate();
        let mut bc = Blockchain::new(test_config());
        let tip = bc.tip().unwrap().clone();
        let greedy = Transaction::system_reward(&miner.address, 1_000).unwrap();
        let mut block = Block::new(1, tip.hash, vec![greedy], 1);
        block.mine(1_000_000);
        assert_eq!(
            bc.add_block(block),
            Err(LedgerError::InvalidReward { index: 1, expected: 100 })
        );
    }

    #[test]
    fn add_block_rejects_overspending_block() {
        let (a, b) = (Wallet::generate(), Wallet::generate());
        let mut bc = Blockchain::new(test_config());
        let tip = bc.tip().unwrap().clone();
        // `a` has nothing confirmed
        let mut block = Block::new(1, tip.hash, vec![transfer(&a, &b, 5, 0)], 1);
        block.mine(1_000_000);
        assert!(matches!(
            bc.add_block(block),
            Err(LedgerError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn peer_block_clears_matching_pending() {
        let (a, b) = (Wallet::generate(), Wallet::generate());
        let mut ours = funded_ledger(&a);
        let mut theirs = Blockchain::new(test_config());
        theirs.add_block(ours.chain()[1].clone()).unwrap();

        let tx = transfer(&a, &b, 7, 0);
        ours.add_transaction(tx.clone()).unwrap();
        theirs.add_transaction(tx).unwrap();

        let block = theirs.mine_pending_transactions(&b.address).unwrap().unwrap();
        ours.add_block(block).unwrap();
        assert!(ours.pending_transactions().is_empty());
        assert_eq!(ours.chain().last().unwrap().hash, theirs.chain().last().unwrap().hash);
    }

    #[test]
    fn conflicting_peer_spend_evicts_local_pending() {
        let (a, b, c) = (Wallet::generate(), Wallet::generate(), Wallet::generate());
        let mut ours = funded_ledger(&a);
        let mut theirs = Blockchain::new(test_config());
        theirs.add_block(ours.chain()[1].clone()).unwrap();

        ours.add_transaction(transfer(&a, &b, 60, 0)).unwrap();
        theirs.add_transaction(transfer(&a, &c, 60, 0)).unwrap();

        let block = theirs.mine_pending_transactions(&c.address).unwrap().unwrap();
        ours.add_block(block).unwrap();

        assert!(ours.pending_transactions().is_empty());
        assert_eq!(ours.confirmed_balance(&a.address), 40);
        assert_eq!(ours.pending_spends(&a.address), 0);
        assert_eq!(ours.get_balance(&a.address), 40);

        // the pool is usable again: spends that fit are accepted and mined
        ours.add_transaction(transfer(&a, &b, 30, 0)).unwrap();
        let mined = ours.mine_pending_transactions(&b.address).unwrap().unwrap();
        assert_eq!(mined.transactions.len(), 2);
        assert_eq!(ours.get_balance(&a.address), 10);
        assert!(ours.is_chain_valid());
    }

    #[test]
    fn revalidation_keeps_spends_that_still_fit_in_order() {
        let (a, b, c) = (Wallet::generate(), Wallet::generate(), Wallet::generate());
        let mut ours = funded_ledger(&a);
        let mut theirs = Blockchain::new(test_config());
        theirs.add_block(ours.chain()[1].clone()).unwrap();

        let first = transfer(&a, &b, 20, 0);
        let second = transfer(&a, &b, 30, 0);
        ours.add_transaction(first.clone()).unwrap();
        ours.add_transaction(second).unwrap();
        theirs.add_transaction(transfer(&a, &c, 70, 0)).unwrap();

        let block = theirs.mine_pending_transactions(&c.address).unwrap().unwrap();
        ours.add_block(block).unwrap();

        // 30 left: the older 20 fits, the 30 after it does not
        assert_eq!(ours.pending_transactions(), &[first]);
        assert!(
            ours.pending_spends(&a.address) <= ours.confirmed_balance(&a.address)
        );
    }

    #[test]
    fn balance_includes_pending_and_history_is_sorted() {
        let (a, b) = (Wallet::generate(), Wallet::generate());
        let mut bc = funded_ledger(&a);
        bc.add_transaction(transfer(&a, &b, 20, 2)).unwrap();

        assert_eq!(bc.confirmed_balance(&a.address), 100);
        assert_eq!(bc.get_balance(&a.address), 78);
        assert_eq!(bc.get_balance(&b.address), 20);

        let history = bc.get_transaction_history(&a.address);
        assert_eq!(history.len(), 2);
        assert!(!history[0].confirmed);
        assert_eq!(history[0].block_index, None);
        assert!(history[1].confirmed);
        assert_eq!(history[1].block_index, Some(1));
        assert!(history[0].transaction.timestamp() >= history[1].transaction.timestamp());
    }

    #[test]
    fn tampered_chain_is_invalid() {
        let miner = Wallet::generate();
        let mut bc = Blockchain::new(test_config());
        bc.mine_pending_transactions(&miner.address).unwrap();
        bc.mine_pending_transactions(&miner.address).unwrap();
        assert!(bc.is_chain_valid());

        bc.chain[1].nonce = bc.chain[1].nonce.wrapping_add(1);
        assert!(!bc.is_chain_valid());
    }

    #[test]
    fn every_accepted_block_meets_its_difficulty() {
        let miner = Wallet::generate();
        let mut bc = Blockchain::new(LedgerConfig {
            difficulty: 2,
            ..test_config()
        });
        for _ in 0..3 {
            bc.mine_pending_transactions(&miner.address).unwrap();
        }
        for b in &bc.chain()[1..] {
            assert!(b.hash.starts_with(&"0".repeat(b.difficulty as usize)));
            assert!(b.difficulty >= 2);
        }
    }

    #[test]
    fn persisted_state_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (Wallet::generate(), Wallet::generate());
        let tip_hash = {
            let store = LedgerStore::open(dir.path()).unwrap();
            let mut bc = Blockchain::open(test_config(), store);
            bc.mine_pending_transactions(&a.address).unwrap();
            bc.add_transaction(transfer(&a, &b, 5, 0)).unwrap();
            bc.tip().unwrap().hash.clone()
        };

        let store = LedgerStore::open(dir.path()).unwrap();
        let bc = Blockchain::open(test_config(), store);
        assert_eq!(bc.len(), 2);
        assert_eq!(bc.tip().unwrap().hash, tip_hash);
        assert_eq!(bc.pending_transactions().len(), 1);
        assert!(!bc.is_durability_degraded());
        assert!(bc.is_chain_valid());
    }

    #[test]
    fn corrupt_persisted_chain_falls_back_to_genesis() {
        let store = LedgerStore::open_temporary().unwrap();
        let mut bad = Block::genesis();
        bad.nonce = 7;
        store.save_state(&[bad], &[]).unwrap();

        let bc = Blockchain::open(test_config(), store);
        assert_eq!(bc.chain(), &[Block::genesis()]);
    }

    #[test]
    fn unreadable_store_is_left_untouched() {
        let store = LedgerStore::open_temporary().unwrap();
        store.put_raw("chain", b"{ truncated").unwrap();

        let mut bc = Blockchain::open(test_config(), store.clone());
        assert!(bc.is_durability_degraded());
        assert_eq!(bc.chain(), &[Block::genesis()]);

        // later mutations stay in memory too
        let miner = Wallet::generate();
        bc.mine_pending_transactions(&miner.address).unwrap().unwrap();
        assert_eq!(bc.len(), 2);
        assert_eq!(
            store.get_raw("chain").unwrap(),
            Some(b"{ truncated".to_vec())
        );
    }
}
