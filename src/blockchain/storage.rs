use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sled::{Batch, Db};
use thiserror::Error;

use super::block::Block;
use super::chain::{Blockchain, ChainConfig, ChainSnapshot};
use super::transaction::Transaction;

/// Key holding [`StoredMetadata`]
pub const METADATA_KEY: &str = "metadata";

/// Key holding the pending transaction pool
pub const PENDING_KEY: &str = "pendingTransactions";

/// Current storage schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Key holding the block at `index`
pub fn block_key(index: u64) -> String {
    format!("block_{}", index)
}

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Unsupported schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Stored chain is corrupt: {0}")]
    Corrupt(String),
}

/// Byte-level key/value capability the ledger persists through
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Writes several entries at once
    ///
    /// Backends without native batches write the entries in order.
    fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        for (key, value) in entries {
            self.put(&key, value)?;
        }
        Ok(())
    }

    /// Makes previous writes durable
    fn flush(&self) -> Result<(), StorageError>;
}

/// On-disk store backed by sled
pub struct SledStore {
    db: Db,
}

impl fmt::Debug for SledStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens (or creates) a sled database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Ok(SledStore {
            db: sled::open(path)?,
        })
    }

    /// Opens a throwaway database that is removed on drop
    pub fn temporary() -> Result<Self, StorageError> {
        Ok(SledStore {
            db: sled::Config::new().temporary(true).open()?,
        })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key.as_bytes())?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for (key, value) in entries {
            batch.insert(key.as_bytes(), value);
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Volatile store for diskless nodes and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Chain-level parameters stored under [`METADATA_KEY`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMetadata {
    pub schema_version: u32,
    pub difficulty: u32,
    pub mining_reward: f64,
    pub chain_length: u64,
}

/// Persists chain snapshots through a [`KeyValueStore`]
///
/// Clones share one writer lock and one record of what the store already
/// holds, so a store should be wrapped by a single `LedgerStorage` and cloned
/// from there.
#[derive(Debug, Clone)]
pub struct LedgerStorage {
    store: Arc<dyn KeyValueStore>,
    // Hash of every stored block, by height.
    written: Arc<Mutex<Vec<String>>>,
}

impl LedgerStorage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        LedgerStorage {
            store,
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(SledStore::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Writes a snapshot as one batch
    ///
    /// Only blocks the store does not already hold at their height are
    /// written, so an append costs one block and a replacement rewrites the
    /// diverging suffix. Concurrent saves are serialized.
    pub fn save(&self, snapshot: &ChainSnapshot) -> Result<(), StorageError> {
        let mut written = self.lock_written();
        self.write_snapshot(snapshot, &mut written)
    }

    /// Snapshots `chain` and writes it while holding the writer lock
    ///
    /// Taking the snapshot under the lock means the last save to finish is
    /// also the newest state, never an older one overtaking it.
    pub fn save_chain(&self, chain: &Blockchain) -> Result<(), StorageError> {
        let mut written = self.lock_written();
        self.write_snapshot(&chain.snapshot(), &mut written)
    }

    fn lock_written(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_snapshot(
        &self,
        snapshot: &ChainSnapshot,
        written: &mut Vec<String>,
    ) -> Result<(), StorageError> {
        let mut batch = Vec::new();
        for (height, block) in snapshot.blocks.iter().enumerate() {
            if written.get(height) != Some(&block.hash) {
                batch.push((block_key(block.index), encode(block)?));
            }
        }
        let changed_blocks = batch.len();

        batch.push((PENDING_KEY.to_string(), encode(&snapshot.pending_transactions)?));

        // Metadata goes last so a partial write never advertises missing blocks.
        let metadata = StoredMetadata {
            schema_version: SCHEMA_VERSION,
            difficulty: snapshot.difficulty,
            mining_reward: snapshot.mining_reward,
            chain_length: snapshot.blocks.len() as u64,
        };
        batch.push((METADATA_KEY.to_string(), encode(&metadata)?));

        self.store.write_batch(batch)?;
        *written = snapshot.blocks.iter().map(|block| block.hash.clone()).collect();
        debug!(
            "Saved snapshot of {} blocks ({} written)",
            snapshot.blocks.len(),
            changed_blocks
        );

        self.store.flush()
    }

    /// Reads a snapshot back
    ///
    /// # Returns
    ///
    /// `None` when no metadata exists, meaning the node starts from genesis
    pub fn load(&self) -> Result<Option<ChainSnapshot>, StorageError> {
        let metadata: StoredMetadata = match self.get(METADATA_KEY)? {
            Some(metadata) => metadata,
            None => return Ok(None),
        };

        if metadata.schema_version != SCHEMA_VERSION {
            return Err(StorageError::UnsupportedVersion {
                found: metadata.schema_version,
                expected: SCHEMA_VERSION,
            });
        }

        // The stored length is not trusted for preallocation.
        let mut blocks = Vec::new();
        for index in 0..metadata.chain_length {
            let block: Block = self
                .get(&block_key(index))?
                .ok_or_else(|| StorageError::NotFound(block_key(index)))?;
            blocks.push(block);
        }

        let pending_transactions: Vec<Transaction> = self.get(PENDING_KEY)?.unwrap_or_default();
        *self.lock_written() = blocks.iter().map(|block| block.hash.clone()).collect();

        Ok(Some(ChainSnapshot {
            blocks,
            difficulty: metadata.difficulty,
            mining_reward: metadata.mining_reward,
            pending_transactions,
        }))
    }

    /// Restores the stored chain, or starts a fresh one from genesis
    pub fn load_chain(&self, config: ChainConfig) -> Result<Blockchain, StorageError> {
        match self.load()? {
            Some(snapshot) => {
                let blocks = snapshot.blocks.len();
                let chain = Blockchain::from_snapshot(snapshot)
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                info!("Loaded {} blocks from storage", blocks);
                Ok(chain)
            }
            None => {
                warn!("No stored chain found, starting from genesis");
                let chain = Blockchain::with_config(config);
                self.save(&chain.snapshot())?;
                Ok(chain)
            }
        }
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.store.get(key)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StorageError::DeserializationError(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}
