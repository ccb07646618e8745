//! # SledBlockStore: Persistent Block Storage
//!
//! Durable [`BlockStore`] built on sled's embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree           | Key                 | Value             |
//! |----------------|---------------------|-------------------|
//! | `blocks`       | `height` (8B BE)    | `bincode(Block)`  |
//! | `block_hashes` | `hash` (32B)        | `height` (8B BE)  |
//! | `metadata`     | key (UTF-8)         | value (bytes)     |
//!
//! Block heights are stored as big-endian u64 so that sled's lexicographic
//! ordering matches numeric ordering and range scans work naturally.
//!
//! ## Atomicity
//!
//! A commit writes the block, its hash index entry and the new tip height in
//! one multi-tree transaction. Either everything lands or nothing does.

use std::path::Path;

use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};

use super::block::Block;
use super::store::{check_append, BlockStore, StorageError, StorageResult};
use crate::consensus::ballot::Height;
use crate::crypto::Hash;

/// Well-known key in the `metadata` tree for the tip height.
const META_LATEST_HEIGHT: &[u8] = b"latest_block_height";

/// Persistent block store.
///
/// Reads go straight to sled. Commits are serialized by `commit_lock` so
/// the tip check and the write form one step.
#[derive(Debug)]
pub struct SledBlockStore {
    db: Db,
    blocks: Tree,
    block_hashes: Tree,
    metadata: Tree,
    commit_lock: Mutex<()>,
}

impl SledBlockStore {
    /// Open or create a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A store that lives in a temporary location and is removed on drop.
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let blocks = db.open_tree("blocks")?;
        let block_hashes = db.open_tree("block_hashes")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            blocks,
            block_hashes,
            metadata,
            commit_lock: Mutex::new(()),
        })
    }

    /// Look a block up by hash through the hash index.
    pub fn block_by_hash(&self, hash: &Hash) -> StorageResult<Option<Block>> {
        match self.block_hashes.get(hash.as_bytes())? {
            Some(height_bytes) => self.block(decode_height(&height_bytes)?),
            None => Ok(None),
        }
    }

    /// Blocks in `[start, end]`, ascending.
    pub fn block_range(&self, start: Height, end: Height) -> StorageResult<Vec<Block>> {
        let mut blocks = Vec::new();
        for entry in self.blocks.range(start.to_be_bytes()..=end.to_be_bytes()) {
            let (_key, value) = entry?;
            blocks.push(decode_block(&value)?);
        }
        Ok(blocks)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Block until pending writes are durable.
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl BlockStore for SledBlockStore {
    fn commit(&self, block: &Block) -> StorageResult<()> {
        let _guard = self.commit_lock.lock();
        let tip = self.last_block()?;
        check_append(tip.as_ref(), block)?;

        let height_key = block.height().to_be_bytes();
        let block_bytes =
            bincode::serialize(block).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let hash_key = *block.hash().as_bytes();

        (&self.blocks, &self.block_hashes, &self.metadata)
            .transaction(|(blocks, hashes, meta)| {
                blocks.insert(&height_key, block_bytes.as_slice())?;
                hashes.insert(&hash_key, &height_key)?;
                meta.insert(META_LATEST_HEIGHT, &height_key)?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => StorageError::Sled(e),
                TransactionError::Abort(()) => {
                    StorageError::Unavailable("commit transaction aborted".to_string())
                }
            })?;

        self.db.flush()?;
        Ok(())
    }

    fn last_height(&self) -> StorageResult<Option<Height>> {
        match self.metadata.get(META_LATEST_HEIGHT)? {
            Some(bytes) => Ok(Some(decode_height(&bytes)?)),
            None => Ok(None),
        }
    }

    fn block(&self, height: Height) -> StorageResult<Option<Block>> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_block(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn decode_height(bytes: &[u8]) -> StorageResult<Height> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupted("invalid height bytes".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn decode_block(bytes: &[u8]) -> StorageResult<Block> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
