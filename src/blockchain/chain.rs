use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::block::{hash_meets_difficulty, Block};
use super::crypto::Address;
use super::events::ChainEvent;
use super::mempool::Mempool;
use super::transaction::{Transaction, TransactionError, TransactionKind};

/// Lowest difficulty a non-genesis block may be mined at
pub const MIN_DIFFICULTY: u32 = 1;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Chain replacement rejected: {0}")]
    ChainReplaceRejected(String),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),
}

/// Consensus parameters a chain is created with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainConfig {
    /// Initial proof of work difficulty
    pub difficulty: u32,

    /// Amount minted by each block's reward transaction
    pub mining_reward: f64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            difficulty: 2,
            mining_reward: 50.0,
        }
    }
}

/// A consistent, owned copy of the whole chain state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub blocks: Vec<Block>,
    pub difficulty: u32,
    pub mining_reward: f64,
    pub pending_transactions: Vec<Transaction>,
}

/// Everything the miner needs to assemble a candidate block
#[derive(Debug, Clone)]
pub struct MiningTemplate {
    pub index: u64,
    pub previous_hash: String,
    pub difficulty: u32,
    pub mining_reward: f64,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug)]
struct ChainState {
    blocks: Vec<Block>,
    difficulty: u32,
    mining_reward: f64,
    mempool: Mempool,
}

impl ChainState {
    fn tip(&self) -> &Block {
        // The chain always holds at least the genesis block.
        &self.blocks[self.blocks.len() - 1]
    }

    fn is_confirmed(&self, id: &str) -> bool {
        self.blocks.iter().any(|block| block.contains_transaction(id))
    }
}

/// The ledger: accepted blocks, pending pool and consensus rules.
///
/// Cloning shares the same underlying state. Mutations (`submit_transaction`,
/// `append`, `replace_chain`, `adjust_difficulty`) take the write lock and are
/// mutually exclusive; readers always observe a whole state, never one that
/// is mid-replacement.
#[derive(Debug, Clone)]
pub struct Blockchain {
    state: Arc<RwLock<ChainState>>,
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain {
    /// Creates a new blockchain holding only the genesis block
    pub fn new() -> Self {
        Self::with_config(ChainConfig::default())
    }

    pub fn with_config(config: ChainConfig) -> Self {
        Blockchain {
            state: Arc::new(RwLock::new(ChainState {
                blocks: vec![Block::genesis()],
                difficulty: config.difficulty.max(MIN_DIFFICULTY),
                mining_reward: config.mining_reward,
                mempool: Mempool::new(),
            })),
        }
    }

    /// Restores a blockchain from a stored snapshot
    ///
    /// The stored blocks are validated as a whole before being trusted.
    pub fn from_snapshot(snapshot: ChainSnapshot) -> Result<Self, BlockchainError> {
        if !validate_chain(&snapshot.blocks) {
            return Err(BlockchainError::InvalidChain(
                "stored blocks failed validation".to_string(),
            ));
        }

        check_chain_rewards(&snapshot.blocks, snapshot.mining_reward)
            .map_err(BlockchainError::InvalidChain)?;

        Ok(Blockchain {
            state: Arc::new(RwLock::new(ChainState {
                blocks: snapshot.blocks,
                difficulty: snapshot.difficulty.max(MIN_DIFFICULTY),
                mining_reward: snapshot.mining_reward,
                mempool: Mempool::from_transactions(snapshot.pending_transactions),
            })),
        })
    }

    // Every mutation validates completely before writing, so a poisoned
    // lock still guards a consistent state.
    fn read(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        let state = self.read();
        ChainSnapshot {
            blocks: state.blocks.clone(),
            difficulty: state.difficulty,
            mining_reward: state.mining_reward,
            pending_transactions: state.mempool.to_vec(),
        }
    }

    pub fn latest_block(&self) -> Block {
        self.read().tip().clone()
    }

    /// Number of blocks, genesis included
    pub fn len(&self) -> usize {
        self.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get_chain(&self) -> Vec<Block> {
        self.read().blocks.clone()
    }

    pub fn get_block(&self, index: u64) -> Option<Block> {
        let state = self.read();
        usize::try_from(index)
            .ok()
            .and_then(|i| state.blocks.get(i).cloned())
    }

    pub fn get_pending_transactions(&self) -> Vec<Transaction> {
        self.read().mempool.to_vec()
    }

    pub fn difficulty(&self) -> u32 {
        self.read().difficulty
    }

    pub fn mining_reward(&self) -> f64 {
        self.read().mining_reward
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.read().mempool.contains(id)
    }

    /// Whether a transaction id is pending or already confirmed
    pub fn has_transaction(&self, id: &str) -> bool {
        let state = self.read();
        state.mempool.contains(id) || state.is_confirmed(id)
    }

    /// Confirmed balance of an address, replayed from genesis
    ///
    /// Pending transactions are not counted.
    pub fn balance_of(&self, address: &Address) -> f64 {
        confirmed_balance(&self.read().blocks, address)
    }

    /// Validates the blockchain held by this instance
    pub fn is_valid(&self) -> bool {
        validate_chain(&self.read().blocks)
    }

    /// Snapshot of tip, pool and parameters for candidate assembly
    pub fn mining_template(&self) -> MiningTemplate {
        let state = self.read();
        let tip = state.tip();
        MiningTemplate {
            index: tip.index + 1,
            previous_hash: tip.hash.clone(),
            difficulty: state.difficulty,
            mining_reward: state.mining_reward,
            transactions: state.mempool.to_vec(),
        }
    }

    /// Admits a transaction to the pending pool
    ///
    /// # Returns
    ///
    /// The `TransactionAdmitted` event on success
    pub fn submit_transaction(&self, transaction: Transaction) -> Result<ChainEvent, BlockchainError> {
        transaction.validate()?;

        if transaction.kind == TransactionKind::Reward {
            return Err(TransactionError::MalformedReward(
                "rewards are only created by miners".to_string(),
            )
            .into());
        }

        if !transaction.verify_signature()? {
            return Err(TransactionError::InvalidSignature.into());
        }

        let mut state = self.write();

        if state.mempool.contains(&transaction.id) || state.is_confirmed(&transaction.id) {
            return Err(TransactionError::Duplicate(transaction.id.clone()).into());
        }

        if let Some(from) = &transaction.from {
            // Pending spends are reserved so the pool can never overdraw once mined.
            let reserved: f64 = state
                .mempool
                .iter()
                .filter(|pending| pending.from.as_ref() == Some(from))
                .map(|pending| pending.amount)
                .sum();
            let available = confirmed_balance(&state.blocks, from) - reserved;
            if available < transaction.amount {
                return Err(TransactionError::InsufficientFunds {
                    required: transaction.amount,
                    available,
                }
                .into());
            }
        }

        state.mempool.insert(transaction.clone());
        info!(
            "Admitted transaction {} ({} pending)",
            transaction.id,
            state.mempool.len()
        );

        Ok(ChainEvent::TransactionAdmitted(transaction))
    }

    /// Appends a block on top of the current tip
    ///
    /// The block is fully re-validated; locally mined and peer blocks take
    /// the same path.
    ///
    /// # Returns
    ///
    /// The `BlockAppended` event on success
    pub fn append(&self, block: Block) -> Result<ChainEvent, BlockchainError> {
        let mut state = self.write();

        check_next_block(state.tip(), &block).map_err(BlockchainError::InvalidBlock)?;
        check_reward(&block, state.mining_reward).map_err(BlockchainError::InvalidBlock)?;

        let removed = state
            .mempool
            .remove_confirmed(block.transactions.iter().map(|tx| tx.id.as_str()));
        state.blocks.push(block.clone());

        info!(
            "Appended block {} ({}), {} transactions confirmed from pool",
            block.index, block.hash, removed
        );

        Ok(ChainEvent::BlockAppended(block))
    }

    /// Replaces the whole chain with a longer, valid candidate
    ///
    /// Pending transactions already confirmed by the adopted chain are
    /// pruned from the pool.
    ///
    /// # Returns
    ///
    /// The `ChainReplaced` event on success
    pub fn replace_chain(&self, candidate: Vec<Block>) -> Result<ChainEvent, BlockchainError> {
        let mut state = self.write();

        if candidate.len() <= state.blocks.len() {
            debug!(
                "Rejected candidate chain of length {} (local length {})",
                candidate.len(),
                state.blocks.len()
            );
            return Err(BlockchainError::ChainReplaceRejected(format!(
                "candidate length {} is not longer than {}",
                candidate.len(),
                state.blocks.len()
            )));
        }

        if !validate_chain(&candidate) {
            debug!("Rejected candidate chain of length {}: invalid", candidate.len());
            return Err(BlockchainError::ChainReplaceRejected(
                "candidate chain failed validation".to_string(),
            ));
        }

        if let Err(reason) = check_chain_rewards(&candidate, state.mining_reward) {
            debug!("Rejected candidate chain of length {}: {}", candidate.len(), reason);
            return Err(BlockchainError::ChainReplaceRejected(reason));
        }

        let pruned = state.mempool.remove_confirmed(
            candidate
                .iter()
                .flat_map(|block| block.transactions.iter())
                .map(|tx| tx.id.as_str()),
        );
        state.blocks = candidate.clone();

        info!(
            "Replaced chain, new length {} ({} pending transactions pruned)",
            state.blocks.len(),
            pruned
        );

        Ok(ChainEvent::ChainReplaced(candidate))
    }

    /// Retargets difficulty from the gap between the two newest blocks
    ///
    /// Faster than half the expected time raises difficulty by one, slower
    /// than double lowers it by one (never below 1). No-op at height 0.
    ///
    /// # Returns
    ///
    /// The difficulty after adjustment
    pub fn adjust_difficulty(&self, expected_block_time_ms: u64) -> u32 {
        let mut state = self.write();

        let len = state.blocks.len();
        if len < 2 {
            return state.difficulty;
        }

        let elapsed = (state.blocks[len - 1].timestamp - state.blocks[len - 2].timestamp)
            .num_milliseconds();
        let expected = i64::try_from(expected_block_time_ms).unwrap_or(i64::MAX);

        let previous = state.difficulty;
        if elapsed < expected / 2 {
            state.difficulty += 1;
        } else if elapsed > expected.saturating_mul(2) && state.difficulty > MIN_DIFFICULTY {
            state.difficulty -= 1;
        }

        if state.difficulty != previous {
            info!(
                "Difficulty adjusted from {} to {} (last block took {}ms, expected {}ms)",
                previous, state.difficulty, elapsed, expected
            );
        }

        state.difficulty
    }

    /// Lowers difficulty by one after a failed search, never below 1
    ///
    /// # Returns
    ///
    /// The difficulty after relaxation
    pub fn relax_difficulty(&self) -> u32 {
        let mut state = self.write();

        if state.difficulty > MIN_DIFFICULTY {
            state.difficulty -= 1;
            info!("Difficulty relaxed to {}", state.difficulty);
        }

        state.difficulty
    }
}

/// Validates a candidate chain end to end.
///
/// Genesis only needs index 0 and a hash with a leading zero digit. Every
/// later block must extend its predecessor, carry a correct hash, merkle root
/// and proof of work, and hold well-formed transactions.
pub fn validate_chain(blocks: &[Block]) -> bool {
    let genesis = match blocks.first() {
        Some(genesis) => genesis,
        None => return false,
    };

    if genesis.index != 0 || !hash_meets_difficulty(&genesis.hash, 1) {
        return false;
    }

    blocks
        .windows(2)
        .all(|pair| check_next_block(&pair[0], &pair[1]).is_ok())
}

/// Checks that `block` is a valid successor of `previous`
fn check_next_block(previous: &Block, block: &Block) -> Result<(), String> {
    if block.index != previous.index + 1 {
        return Err(format!(
            "expected index {}, got {}",
            previous.index + 1,
            block.index
        ));
    }

    if block.previous_hash != previous.hash {
        return Err(format!(
            "block {} does not link to tip {}",
            block.index, previous.hash
        ));
    }

    if block.difficulty < MIN_DIFFICULTY {
        return Err(format!("difficulty {} is below minimum", block.difficulty));
    }

    if !block.has_valid_merkle_root() {
        return Err(format!("block {} has a wrong merkle root", block.index));
    }

    if !block.has_valid_hash() {
        return Err(format!("block {} has a wrong hash", block.index));
    }

    if !block.meets_difficulty() {
        return Err(format!(
            "hash {} does not meet difficulty {}",
            block.hash, block.difficulty
        ));
    }

    let rewards = block.transactions.iter().filter(|tx| tx.is_reward()).count();
    if rewards > 1 {
        return Err(format!("block {} has {} reward transactions", block.index, rewards));
    }

    for tx in &block.transactions {
        tx.check()
            .map_err(|e| format!("transaction {} is invalid: {}", tx.id, e))?;
    }

    Ok(())
}

/// Checks that a block's reward, if any, mints exactly `mining_reward`
fn check_reward(block: &Block, mining_reward: f64) -> Result<(), String> {
    match block.transactions.iter().find(|tx| tx.is_reward()) {
        Some(reward) if reward.amount != mining_reward => Err(format!(
            "block {} rewards {} instead of {}",
            block.index, reward.amount, mining_reward
        )),
        _ => Ok(()),
    }
}

fn check_chain_rewards(blocks: &[Block], mining_reward: f64) -> Result<(), String> {
    blocks
        .iter()
        .skip(1)
        .try_for_each(|block| check_reward(block, mining_reward))
}

/// Replays every confirmed transaction to compute a balance
fn confirmed_balance(blocks: &[Block], address: &Address) -> f64 {
    blocks
        .iter()
        .flat_map(|block| block.transactions.iter())
        .fold(0.0, |mut balance, tx| {
            if &tx.to == address {
                balance += tx.amount;
            }
            if tx.from.as_ref() == Some(address) {
                balance -= tx.amount;
            }
            balance
        })
}
