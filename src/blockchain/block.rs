use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::crypto::{self, ZERO_HASH};
use super::merkle;
use super::transaction::Transaction;

/// Difficulty the genesis block is mined at
pub const GENESIS_DIFFICULTY: u32 = 1;

/// Current block schema version
pub const BLOCK_VERSION: u32 = 1;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Version of the block structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Height of the block in the chain, 0 for genesis
    pub index: u64,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Timestamp when the block was assembled
    pub timestamp: DateTime<Utc>,

    /// Transactions included in this block, in order
    pub transactions: Vec<Transaction>,

    /// Number of leading zero hex digits the hash must carry
    pub difficulty: u32,

    /// Proof of work counter
    pub nonce: u64,

    /// Merkle commitment over the transactions
    pub merkle_root: String,

    /// Hash of the block header
    pub hash: String,
}

fn default_version() -> u32 {
    BLOCK_VERSION
}

impl Block {
    /// Creates an unmined block at nonce 0
    ///
    /// # Arguments
    ///
    /// * `index` - The height of the block in the chain
    /// * `previous_hash` - The hash of the previous block
    /// * `transactions` - The transactions to include in the block
    /// * `difficulty` - The number of leading zero hex digits required
    pub fn new(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
    ) -> Self {
        Self::with_timestamp(index, previous_hash, Utc::now(), transactions, difficulty)
    }

    pub fn with_timestamp(
        index: u64,
        previous_hash: String,
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
        difficulty: u32,
    ) -> Self {
        let mut block = Block {
            version: default_version(),
            index,
            previous_hash,
            timestamp,
            transactions,
            difficulty,
            nonce: 0,
            merkle_root: String::new(),
            hash: String::new(),
        };

        // The header hash covers the root, so the root comes first.
        block.merkle_root = block.calculate_merkle_root();
        block.hash = block.calculate_hash();
        block
    }

    /// The fixed genesis block every node starts from
    ///
    /// Its content is constant so independently started nodes agree on it.
    pub fn genesis() -> Self {
        let timestamp = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or_default();
        let mut block = Self::with_timestamp(
            0,
            ZERO_HASH.to_string(),
            timestamp,
            Vec::new(),
            GENESIS_DIFFICULTY,
        );

        while !block.meets_difficulty() {
            block.nonce += 1;
            block.hash = block.calculate_hash();
        }

        block
    }

    /// Calculates the header hash
    ///
    /// Covers index, previous hash, timestamp, merkle root, nonce and
    /// difficulty. Transactions are covered through the merkle root.
    pub fn calculate_hash(&self) -> String {
        let header = serde_json::json!({
            "index": self.index,
            "previous_hash": self.previous_hash,
            "timestamp": self.timestamp,
            "merkle_root": self.merkle_root,
            "nonce": self.nonce,
            "difficulty": self.difficulty,
        });

        crypto::hash_hex(header.to_string().as_bytes())
    }

    /// Calculates the merkle root over the transactions.
    ///
    /// Leaves are transaction hashes, each of which commits to the
    /// transaction id together with its content. Roots therefore differ
    /// from those of ledgers that commit to bare ids, and blocks do not
    /// interoperate with them.
    pub fn calculate_merkle_root(&self) -> String {
        let leaves: Vec<[u8; 32]> = self.transactions.iter().map(Transaction::hash).collect();
        merkle::merkle_root(leaves.as_slice())
    }

    pub fn meets_difficulty(&self) -> bool {
        hash_meets_difficulty(&self.hash, self.difficulty)
    }

    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub fn has_valid_merkle_root(&self) -> bool {
        self.merkle_root == self.calculate_merkle_root()
    }

    pub fn contains_transaction(&self, id: &str) -> bool {
        self.transactions.iter().any(|tx| tx.id == id)
    }
}

/// Checks that the first `difficulty` hex digits of `hash` are all zero
pub fn hash_meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Address;

    fn rewards() -> Vec<Transaction> {
        vec![
            Transaction::new_reward(Address("recipient1".to_string()), 10.0),
            Transaction::new_reward(Address("recipient2".to_string()), 20.0),
        ]
    }

    #[test]
    fn test_new_block() {
        let block = Block::new(1, "previous_hash".to_string(), rewards(), 2);

        assert_eq!(block.index, 1);
        assert_eq!(block.nonce, 0);
        assert_eq!(block.previous_hash, "previous_hash");
        assert_eq!(block.hash.len(), 64);
        assert!(block.has_valid_hash());
        assert!(block.has_valid_merkle_root());
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();

        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, ZERO_HASH);
        assert_eq!(genesis.difficulty, GENESIS_DIFFICULTY);
        assert!(genesis.transactions.is_empty());
        assert_eq!(genesis.merkle_root, ZERO_HASH);
        assert!(genesis.hash.starts_with('0'));
        assert_eq!(genesis, Block::genesis());
    }

    #[test]
    fn test_hash_depends_on_nonce() {
        let mut block = Block::new(1, "prev".to_string(), rewards(), 1);
        let first = block.calculate_hash();
        block.nonce += 1;

        assert_ne!(first, block.calculate_hash());
    }

    #[test]
    fn test_tampered_transaction_changes_merkle_root() {
        let mut block = Block::new(1, "prev".to_string(), rewards(), 1);
        block.transactions[0].amount = 1_000.0;

        assert!(!block.has_valid_merkle_root());
        // The stored header hash is unchanged, so only the root reveals it.
        assert!(block.has_valid_hash());
    }

    #[test]
    fn test_merkle_leaves_are_transaction_hashes() {
        let block = Block::new(1, "prev".to_string(), rewards(), 1);
        let ids: Vec<&[u8]> = block.transactions.iter().map(|tx| tx.id.as_bytes()).collect();
        let hashes: Vec<[u8; 32]> = block.transactions.iter().map(Transaction::hash).collect();

        assert_eq!(block.merkle_root, merkle::merkle_root(hashes.as_slice()));
        assert_ne!(block.merkle_root, merkle::merkle_root(ids.as_slice()));
    }

    #[test]
    fn test_hash_meets_difficulty() {
        assert!(hash_meets_difficulty("00ab", 2));
        assert!(!hash_meets_difficulty("0fab", 2));
        assert!(hash_meets_difficulty("abcd", 0));
        assert!(!hash_meets_difficulty("00", 3));
    }

    #[test]
    fn test_bincode_round_trip() {
        let block = Block::new(3, "prev".to_string(), rewards(), 1);

        let bytes = bincode::serialize(&block).unwrap();
        let decoded: Block = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.hash, block.hash);
        assert_eq!(decoded.merkle_root, block.merkle_root);
    }
}
