//! # Block Structure
//!
//! A block is what one height finalizes. It is computed deterministically
//! from the round's proposal, so every correct validator that processes the
//! same proposal arrives at the same block hash and votes for it.
//!
//! ## Block Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  BlockHeader                                  │
//! │  ├── height: u64                              │
//! │  ├── round: u64         (round it was agreed) │
//! │  ├── hash: Hash         (BLAKE3 of header)    │
//! │  ├── parent_hash: Hash                        │
//! │  ├── proposal: Hash     (source proposal)     │
//! │  ├── proposer: Option<Address>                │
//! │  ├── timestamp: u64     (proposal timestamp)  │
//! │  └── operations_root: Hash (Merkle root)      │
//! ├───────────────────────────────────────────────┤
//! │  operations: Vec<Vec<u8>>   (opaque payloads) │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The timestamp comes from the proposal, never from the local clock.
//! Otherwise validators would disagree on the hash.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BLOCK_DOMAIN, GENESIS_MESSAGE, OPERATIONS_DOMAIN};
use crate::consensus::ballot::{Height, Round};
use crate::crypto::{Address, Hash};

/// Integrity failures found by [`Block::verify`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block {height} hash mismatch: stored={stored}, computed={computed}")]
    HashMismatch {
        height: Height,
        stored: Hash,
        computed: Hash,
    },

    #[error("block {height} operations root mismatch")]
    OperationsRootMismatch { height: Height },

    #[error("genesis block must have a zero parent hash")]
    GenesisParent,

    #[error("block {height} does not extend block {parent_height} ({reason})")]
    BrokenLink {
        height: Height,
        parent_height: Height,
        reason: &'static str,
    },
}

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: Height,
    pub round: Round,
    pub hash: Hash,
    pub parent_hash: Hash,
    pub proposal: Hash,
    /// `None` only for genesis.
    pub proposer: Option<Address>,
    /// Unix milliseconds, copied from the proposal.
    pub timestamp: u64,
    pub operations_root: Hash,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A finalized (or about to be finalized) block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub operations: Vec<Vec<u8>>,
}

impl Block {
    /// The genesis block. Height 0, zero parent, no operations.
    pub fn genesis() -> Self {
        let proposal = Hash::digest(GENESIS_MESSAGE);
        let operations_root = compute_operations_root(&[]);
        let mut header = BlockHeader {
            height: 0,
            round: 0,
            hash: Hash::ZERO,
            parent_hash: Hash::ZERO,
            proposal,
            proposer: None,
            timestamp: 0,
            operations_root,
        };
        header.hash = compute_header_hash(&header);
        Block {
            header,
            operations: Vec::new(),
        }
    }

    /// Build a block on top of `parent_hash` at `height`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        height: Height,
        round: Round,
        parent_hash: Hash,
        proposal: Hash,
        proposer: Address,
        timestamp: u64,
        operations: Vec<Vec<u8>>,
    ) -> Self {
        let mut header = BlockHeader {
            height,
            round,
            hash: Hash::ZERO,
            parent_hash,
            proposal,
            proposer: Some(proposer),
            timestamp,
            operations_root: compute_operations_root(&operations),
        };
        header.hash = compute_header_hash(&header);
        Block { header, operations }
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    /// Recompute the header hash from the header fields.
    pub fn compute_hash(&self) -> Hash {
        compute_header_hash(&self.header)
    }

    /// Check hash and operations root consistency.
    pub fn verify(&self) -> Result<(), BlockError> {
        let computed = self.compute_hash();
        if computed != self.header.hash {
            return Err(BlockError::HashMismatch {
                height: self.header.height,
                stored: self.header.hash,
                computed,
            });
        }
        if compute_operations_root(&self.operations) != self.header.operations_root {
            return Err(BlockError::OperationsRootMismatch {
                height: self.header.height,
            });
        }
        if self.header.height == 0 && !self.header.parent_hash.is_zero() {
            return Err(BlockError::GenesisParent);
        }
        Ok(())
    }

    /// Check that this block directly extends `parent`.
    pub fn verify_link(&self, parent: &Block) -> Result<(), BlockError> {
        let broken = |reason| BlockError::BrokenLink {
            height: self.header.height,
            parent_height: parent.header.height,
            reason,
        };
        if self.header.height != parent.header.height + 1 {
            return Err(broken("height is not contiguous"));
        }
        if self.header.parent_hash != parent.header.hash {
            return Err(broken("parent hash differs"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hash Computation
// ---------------------------------------------------------------------------

fn compute_header_hash(header: &BlockHeader) -> Hash {
    let proposer = header
        .proposer
        .as_ref()
        .map(|a| a.as_str().as_bytes())
        .unwrap_or_default();
    Hash::of_parts(
        BLOCK_DOMAIN,
        &[
            &header.height.to_le_bytes(),
            &header.round.to_le_bytes(),
            header.parent_hash.as_bytes(),
            header.proposal.as_bytes(),
            proposer,
            &header.timestamp.to_le_bytes(),
            header.operations_root.as_bytes(),
        ],
    )
}

/// Binary Merkle root over operation payloads. Leaves are BLAKE3 of each
/// payload; an odd node is paired with itself. Empty lists hash the domain
/// tag alone.
pub fn compute_operations_root(operations: &[Vec<u8>]) -> Hash {
    if operations.is_empty() {
        return Hash::of_parts(OPERATIONS_DOMAIN, &[]);
    }

    let mut level: Vec<Hash> = operations.iter().map(|op| Hash::digest(op)).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                Hash::of_parts(OPERATIONS_DOMAIN, &[pair[0].as_bytes(), right.as_bytes()])
            })
            .collect();
    }
    level[0]
}
