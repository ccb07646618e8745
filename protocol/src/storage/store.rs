//! # Block Store
//!
//! The consensus core only needs three things from storage: append the
//! block a round just finalized, report the tip height, and read a block
//! back by height. [`BlockStore`] is that contract. Two implementations:
//!
//! - [`MemoryBlockStore`]: a `Vec<Block>` behind a lock. Used by tests and
//!   by the node when no data directory is given.
//! - [`SledBlockStore`](super::db::SledBlockStore): durable, on disk.
//!
//! Both enforce the same append rule: a block must sit exactly at
//! `tip + 1` and name the tip as its parent. A store never holds a gap.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

use super::block::{Block, BlockError};
use crate::consensus::ballot::Height;
use crate::crypto::Hash;

/// Errors from any [`BlockStore`] implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("block {got} is not contiguous with the tip (expected height {expected})")]
    NonContiguous { expected: Height, got: Height },

    #[error("block {height} parent {parent} does not match tip {tip}")]
    ParentMismatch {
        height: Height,
        parent: Hash,
        tip: Hash,
    },

    #[error("invalid block: {0}")]
    InvalidBlock(#[from] BlockError),

    #[error("storage corrupted: {0}")]
    Corrupted(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Append-only block persistence used by the consensus handlers.
pub trait BlockStore: Send + Sync + std::fmt::Debug {
    /// Append `block`. Fails unless it extends the current tip.
    fn commit(&self, block: &Block) -> StorageResult<()>;

    /// Height of the tip, or `None` for an empty store.
    fn last_height(&self) -> StorageResult<Option<Height>>;

    fn block(&self, height: Height) -> StorageResult<Option<Block>>;

    fn last_block(&self) -> StorageResult<Option<Block>> {
        match self.last_height()? {
            Some(h) => self.block(h),
            None => Ok(None),
        }
    }
}

/// Check that `block` may be appended on top of `tip`.
pub(crate) fn check_append(tip: Option<&Block>, block: &Block) -> StorageResult<()> {
    block.verify()?;
    match tip {
        None if block.height() == 0 => Ok(()),
        None => Err(StorageError::NonContiguous {
            expected: 0,
            got: block.height(),
        }),
        Some(tip) => {
            if block.height() != tip.height() + 1 {
                return Err(StorageError::NonContiguous {
                    expected: tip.height() + 1,
                    got: block.height(),
                });
            }
            if block.header.parent_hash != tip.hash() {
                return Err(StorageError::ParentMismatch {
                    height: block.height(),
                    parent: block.header.parent_hash,
                    tip: tip.hash(),
                });
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBlockStore
// ---------------------------------------------------------------------------

/// In-memory block store.
///
/// `fail_next_commits` makes the next N commits return
/// [`StorageError::Unavailable`], which lets tests drive the commit retry
/// and escalation paths.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<Vec<Block>>,
    failing_commits: AtomicU32,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding only the genesis block.
    pub fn with_genesis() -> Self {
        Self {
            blocks: RwLock::new(vec![Block::genesis()]),
            failing_commits: AtomicU32::new(0),
        }
    }

    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Replace a stored block without any checks. Test hook for corruption.
    #[cfg(test)]
    pub(crate) fn overwrite(&self, block: Block) {
        let mut blocks = self.blocks.write();
        let idx = block.height() as usize;
        if idx < blocks.len() {
            blocks[idx] = block;
        }
    }
}

impl BlockStore for MemoryBlockStore {
    fn commit(&self, block: &Block) -> StorageResult<()> {
        let pending = self.failing_commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_commits.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable(format!(
                "injected failure committing block {}",
                block.height()
            )));
        }

        let mut blocks = self.blocks.write();
        check_append(blocks.last(), block)?;
        blocks.push(block.clone());
        Ok(())
    }

    fn last_height(&self) -> StorageResult<Option<Height>> {
        Ok(self.blocks.read().last().map(Block::height))
    }

    fn block(&self, height: Height) -> StorageResult<Option<Block>> {
        Ok(self.blocks.read().get(height as usize).cloned())
    }
}
