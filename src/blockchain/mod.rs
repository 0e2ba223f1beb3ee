// Blockchain module
//
// This module contains the ledger core:
// - Block and transaction records
// - Crypto capability and Merkle commitments
// - The chain with its consensus rules and pending pool
// - Event outbox, persistence and proof of work mining

pub mod block;
pub mod chain;
pub mod crypto;
pub mod events;
pub mod mempool;
pub mod merkle;
pub mod miner;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{validate_chain, Blockchain, BlockchainError, ChainConfig, ChainSnapshot};
pub use crypto::{Address, DigitalSignature, KeyPair};
pub use events::{ChainEvent, EventDispatcher, Notification, Origin};
pub use miner::{CancelToken, Miner, MinerHandle, MiningError, MiningPolicy};
pub use storage::{LedgerStorage, StorageError};
pub use transaction::{Transaction, TransactionKind};
