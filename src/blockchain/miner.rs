//! Proof of work mining.
//!
//! A candidate block is assembled from a snapshot of the tip and the pending
//! pool, then a blocking nonce search runs off the async runtime. The search
//! either finds a real solution, gives up with a retryable
//! [`MiningError::DeadlineExceeded`], or stops at a nonce boundary when
//! cancelled. It never produces a block whose hash does not satisfy its own
//! difficulty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;

use super::block::Block;
use super::chain::{BlockchainError, MiningTemplate};
use super::crypto::Address;
use super::events::{EventDispatcher, Origin};
use super::transaction::Transaction;

// Instant::now is comparatively slow; the deadline is polled in batches.
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

/// Errors that can occur while mining
#[derive(Debug, Error)]
pub enum MiningError {
    #[error("Mining deadline exceeded after {attempts} attempts at difficulty {difficulty}")]
    DeadlineExceeded { attempts: u64, difficulty: u32 },

    #[error("Mining cancelled")]
    Cancelled,

    #[error("Mined block was not accepted: {0}")]
    Stale(#[from] BlockchainError),

    #[error("Mining task failed: {0}")]
    TaskFailed(String),
}

impl MiningError {
    /// Whether trying again with a fresh candidate can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, MiningError::DeadlineExceeded { .. } | MiningError::Stale(_))
    }
}

/// Limits on a single nonce search. The default is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiningPolicy {
    pub max_attempts: Option<u64>,
    pub deadline: Option<Duration>,
}

/// Shared flag that stops a running search
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Builds an unsolved candidate: a reward to the miner followed by every
/// pending transaction in the template
pub fn assemble_candidate(template: MiningTemplate, miner: &Address) -> Block {
    let mut transactions = Vec::with_capacity(template.transactions.len() + 1);
    transactions.push(Transaction::new_reward(miner.clone(), template.mining_reward));
    transactions.extend(template.transactions);

    Block::new(
        template.index,
        template.previous_hash,
        transactions,
        template.difficulty,
    )
}

/// Searches nonces from 0 until the block hash meets its difficulty
pub fn solve(
    mut block: Block,
    policy: &MiningPolicy,
    cancel: &CancelToken,
) -> Result<Block, MiningError> {
    let started = Instant::now();
    let mut attempts: u64 = 0;
    block.nonce = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(MiningError::Cancelled);
        }

        block.hash = block.calculate_hash();
        attempts += 1;

        if block.meets_difficulty() {
            debug!(
                "Solved block {} after {} attempts in {:?}",
                block.index,
                attempts,
                started.elapsed()
            );
            return Ok(block);
        }

        let exhausted = policy.max_attempts.is_some_and(|max| attempts >= max)
            || (attempts % DEADLINE_CHECK_INTERVAL == 0
                && policy.deadline.is_some_and(|deadline| started.elapsed() >= deadline));

        block.nonce = match block.nonce.checked_add(1) {
            Some(nonce) if !exhausted => nonce,
            _ => {
                return Err(MiningError::DeadlineExceeded {
                    attempts,
                    difficulty: block.difficulty,
                })
            }
        };
    }
}

/// Turns the pending pool into blocks credited to one address
#[derive(Debug, Clone)]
pub struct Miner {
    address: Address,
    dispatcher: EventDispatcher,
    policy: MiningPolicy,
    expected_block_time_ms: u64,
}

impl Miner {
    pub fn new(
        address: Address,
        dispatcher: EventDispatcher,
        policy: MiningPolicy,
        expected_block_time_ms: u64,
    ) -> Self {
        Miner {
            address,
            dispatcher,
            policy,
            expected_block_time_ms,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Mines and appends a single block
    ///
    /// The candidate's transactions are a snapshot; submissions arriving
    /// during the search wait for the next block.
    pub async fn mine_once(&self, cancel: &CancelToken) -> Result<Block, MiningError> {
        let chain = self.dispatcher.chain();
        let candidate = assemble_candidate(chain.mining_template(), &self.address);
        info!(
            "Mining block {} with {} transactions at difficulty {}",
            candidate.index,
            candidate.transactions.len(),
            candidate.difficulty
        );

        let policy = self.policy;
        let token = cancel.clone();
        let block = tokio::task::spawn_blocking(move || solve(candidate, &policy, &token))
            .await
            .map_err(|e| MiningError::TaskFailed(e.to_string()))??;

        let event = chain.append(block.clone())?;
        // Persistence failures are logged by the dispatcher and do not undo the append.
        let _ = self.dispatcher.dispatch(Origin::Local, event);
        chain.adjust_difficulty(self.expected_block_time_ms);

        Ok(block)
    }

    /// Runs the mining loop in the background until stopped
    pub fn spawn(self) -> MinerHandle {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { self.run(token).await });

        MinerHandle { cancel, handle }
    }

    async fn run(self, cancel: CancelToken) {
        info!("Miner started for {}", self.address);

        while !cancel.is_cancelled() {
            match self.mine_once(&cancel).await {
                Ok(block) => info!("Mined block {} ({})", block.index, block.hash),
                Err(MiningError::Cancelled) => break,
                Err(err @ MiningError::DeadlineExceeded { .. }) => {
                    let difficulty = self.dispatcher.chain().relax_difficulty();
                    warn!("{}, retrying at difficulty {}", err, difficulty);
                }
                Err(MiningError::Stale(err)) => {
                    debug!("Discarding stale candidate: {}", err);
                }
                Err(err) => {
                    error!("Miner stopped: {}", err);
                    break;
                }
            }
            tokio::task::yield_now().await;
        }

        info!("Miner stopped for {}", self.address);
    }
}

/// Handle to a background mining task
#[derive(Debug)]
pub struct MinerHandle {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

impl MinerHandle {
    /// Cancels the search at the next nonce and waits for the task to end
    ///
    /// An abandoned candidate is dropped; nothing partial reaches the chain.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            error!("Mining task ended abnormally: {}", err);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
