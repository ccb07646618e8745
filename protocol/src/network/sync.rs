//! # Block Sync Sources
//!
//! A node that falls behind fetches the blocks it missed from somewhere.
//! The Syncing handler does not care where. It asks a [`BlockSource`] for
//! one height at a time, verifies each block against its predecessor, and
//! commits it.
//!
//! [`PeerBlockSource`] reads directly from other validators' block stores.
//! That is what the in-process network uses; a networked deployment would
//! put a request/response protocol behind the same trait.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::consensus::ballot::Height;
use crate::storage::{Block, BlockError, BlockStore, StorageError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no source has block {height}")]
    Unavailable { height: Height },

    #[error("fetched block {height} is invalid: {source}")]
    InvalidBlock {
        height: Height,
        #[source]
        source: BlockError,
    },

    #[error("fetched block for height {requested} reports height {got}")]
    WrongHeight { requested: Height, got: Height },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Where missing blocks come from.
pub trait BlockSource: Send + Sync + fmt::Debug {
    /// The finalized block at `height`, if the source has it.
    fn fetch(&self, height: Height) -> Result<Option<Block>, SyncError>;

    /// Highest finalized height the source can serve.
    fn highest(&self) -> Result<Option<Height>, SyncError>;
}

/// Reads blocks from peer stores, first hit wins.
#[derive(Debug, Default)]
pub struct PeerBlockSource {
    peers: RwLock<Vec<Arc<dyn BlockStore>>>,
}

impl PeerBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: Vec<Arc<dyn BlockStore>>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    pub fn add_peer(&self, peer: Arc<dyn BlockStore>) {
        self.peers.write().push(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

impl BlockSource for PeerBlockSource {
    fn fetch(&self, height: Height) -> Result<Option<Block>, SyncError> {
        let peers = self.peers.read().clone();
        for (idx, peer) in peers.iter().enumerate() {
            match peer.block(height) {
                Ok(Some(block)) => {
                    if block.height() != height {
                        return Err(SyncError::WrongHeight {
                            requested: height,
                            got: block.height(),
                        });
                    }
                    return Ok(Some(block));
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(peer = idx, height, error = %e, "peer store read failed");
                    continue;
                }
            }
        }
        Ok(None)
    }

    fn highest(&self) -> Result<Option<Height>, SyncError> {
        let peers = self.peers.read().clone();
        let mut highest = None;
        for (idx, peer) in peers.iter().enumerate() {
            match peer.last_height() {
                Ok(height) => highest = highest.max(height),
                Err(e) => debug!(peer = idx, error = %e, "peer store height unreadable"),
            }
        }
        Ok(highest)
    }
}

/// Fetch `height` from `source`, check it on its own and against `parent`.
pub fn fetch_verified(
    source: &dyn BlockSource,
    height: Height,
    parent: &Block,
) -> Result<Block, SyncError> {
    let block = source
        .fetch(height)?
        .ok_or(SyncError::Unavailable { height })?;
    block
        .verify()
        .and_then(|_| block.verify_link(parent))
        .map_err(|source| SyncError::InvalidBlock { height, source })?;
    Ok(block)
}
