//! Outbox for accepted chain mutations.
//!
//! Mutating chain operations return a [`ChainEvent`] instead of calling
//! into I/O themselves. The [`EventDispatcher`] persists the resulting state
//! and fans the event out to subscribers such as the sync relay.

use log::{debug, error};
use tokio::sync::broadcast;

use super::block::Block;
use super::chain::Blockchain;
use super::storage::{LedgerStorage, StorageError};
use super::transaction::Transaction;

const CHANNEL_CAPACITY: usize = 256;

/// An accepted mutation of the chain state
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    TransactionAdmitted(Transaction),
    BlockAppended(Block),
    ChainReplaced(Vec<Block>),
}

impl ChainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::TransactionAdmitted(_) => "TransactionAdmitted",
            ChainEvent::BlockAppended(_) => "BlockAppended",
            ChainEvent::ChainReplaced(_) => "ChainReplaced",
        }
    }
}

/// Where the input behind an event came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by this node (local submission or local mining)
    Local,
    /// Received from the named peer
    Peer(String),
}

/// An event together with its origin, as seen by subscribers
#[derive(Debug, Clone)]
pub struct Notification {
    pub origin: Origin,
    pub event: ChainEvent,
}

/// Forwards chain events to persistence and subscribers
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    chain: Blockchain,
    storage: Option<LedgerStorage>,
    sender: broadcast::Sender<Notification>,
}

impl EventDispatcher {
    pub fn new(chain: Blockchain, storage: Option<LedgerStorage>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventDispatcher {
            chain,
            storage,
            sender,
        }
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Persists the current state and notifies subscribers
    ///
    /// A persistence failure is logged and returned so the caller may retry,
    /// but the in-memory mutation stands and subscribers are still notified.
    pub fn dispatch(&self, origin: Origin, event: ChainEvent) -> Result<(), StorageError> {
        let persisted = self.persist();
        if let Err(err) = &persisted {
            error!("Failed to persist state after {}: {}", event.name(), err);
        }

        debug!("Dispatching {} from {:?}", event.name(), origin);
        // Having no subscribers is fine.
        let _ = self.sender.send(Notification { origin, event });

        persisted
    }

    /// Writes a consistent snapshot of the chain to storage, if configured
    pub fn persist(&self) -> Result<(), StorageError> {
        match &self.storage {
            Some(storage) => storage.save_chain(&self.chain),
            None => Ok(()),
        }
    }
}
