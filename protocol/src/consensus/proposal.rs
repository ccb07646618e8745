//! # Proposals
//!
//! The round's designated proposer packs pending operations into a signed
//! [`Proposal`]. Every validator turns the same proposal into the same
//! [`Block`] through a [`ProposalValidator`], then votes for that block's
//! hash in its SIGN and ACCEPT ballots.
//!
//! ```text
//! OperationPool ──► ProposalMaker ──► Proposal ──► broadcast
//!                                        │
//!        compiler: signature + proposer  ▼
//!                                   ProposalPool
//!                                        │
//!         handler: ProposalValidator ────┴──► Block ──► SIGN / ACCEPT
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::ballot::{Height, Round};
use super::home::HomeState;
use crate::config::{MAX_OPERATIONS_PER_PROPOSAL, PROPOSAL_DOMAIN};
use crate::crypto::{Address, Hash, Keypair, PublicKey, Signature};
use crate::storage::{compute_operations_root, Block};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProposalError {
    #[error("proposal hash does not match its content")]
    HashMismatch,

    #[error("proposal node {0} does not match its signer key")]
    SignerMismatch(Address),

    #[error("proposal signature does not verify")]
    BadSignature,

    #[error("proposal for height {got}, expected {expected}")]
    HeightMismatch { expected: Height, got: Height },

    #[error("proposal builds on {got}, local last block is {expected}")]
    LastBlockMismatch { expected: Hash, got: Hash },

    #[error("proposal carries {count} operations, limit is {limit}")]
    TooManyOperations { count: usize, limit: usize },
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// A signed block proposal for one (height, round).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub proposer: Address,
    pub signer: PublicKey,
    pub last_block: Hash,
    pub operations: Vec<Vec<u8>>,
    /// Unix milliseconds chosen by the proposer. Becomes the block timestamp.
    pub timestamp: u64,
    pub hash: Hash,
    pub signature: Signature,
}

impl Proposal {
    pub fn sign(
        height: Height,
        round: Round,
        last_block: Hash,
        operations: Vec<Vec<u8>>,
        timestamp: u64,
        keypair: &Keypair,
    ) -> Self {
        let proposer = keypair.address();
        let hash = content_hash(height, round, &proposer, &last_block, &operations, timestamp);
        Self {
            height,
            round,
            signature: keypair.sign(hash.as_bytes()),
            signer: keypair.public_key(),
            proposer,
            last_block,
            operations,
            timestamp,
            hash,
        }
    }

    /// Check the content hash, the proposer/key binding and the signature.
    pub fn verify(&self) -> Result<(), ProposalError> {
        let computed = content_hash(
            self.height,
            self.round,
            &self.proposer,
            &self.last_block,
            &self.operations,
            self.timestamp,
        );
        if computed != self.hash {
            return Err(ProposalError::HashMismatch);
        }
        if !self.proposer.matches(&self.signer) {
            return Err(ProposalError::SignerMismatch(self.proposer.clone()));
        }
        if !self.signer.verify(self.hash.as_bytes(), &self.signature) {
            return Err(ProposalError::BadSignature);
        }
        Ok(())
    }
}

fn content_hash(
    height: Height,
    round: Round,
    proposer: &Address,
    last_block: &Hash,
    operations: &[Vec<u8>],
    timestamp: u64,
) -> Hash {
    let operations_root = compute_operations_root(operations);
    Hash::of_parts(
        PROPOSAL_DOMAIN,
        &[
            &height.to_le_bytes(),
            &round.to_le_bytes(),
            proposer.as_str().as_bytes(),
            last_block.as_bytes(),
            operations_root.as_bytes(),
            &timestamp.to_le_bytes(),
        ],
    )
}

// ---------------------------------------------------------------------------
// OperationPool
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PoolInner {
    queue: VecDeque<(Hash, Vec<u8>)>,
    seen: HashSet<Hash>,
}

/// FIFO of opaque operations waiting to be proposed. Deduplicated by hash.
#[derive(Debug, Default)]
pub struct OperationPool {
    inner: Mutex<PoolInner>,
}

impl OperationPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `operation`. Returns `false` for a duplicate.
    pub fn push(&self, operation: Vec<u8>) -> bool {
        let hash = Hash::digest(&operation);
        let mut inner = self.inner.lock();
        if !inner.seen.insert(hash) {
            return false;
        }
        inner.queue.push_back((hash, operation));
        true
    }

    /// Up to `max` operations from the front, left in the pool.
    pub fn peek(&self, max: usize) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .queue
            .iter()
            .take(max)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Drop the operations a committed block carried.
    pub fn remove_committed(&self, block: &Block) -> usize {
        let committed: HashSet<Hash> = block.operations.iter().map(|op| Hash::digest(op)).collect();
        let mut inner = self.inner.lock();
        let before = inner.queue.len();
        inner.queue.retain(|(hash, _)| !committed.contains(hash));
        for hash in &committed {
            inner.seen.remove(hash);
        }
        before - inner.queue.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ProposalMaker
// ---------------------------------------------------------------------------

/// Builds and signs this node's proposals.
#[derive(Debug, Clone)]
pub struct ProposalMaker {
    keypair: Keypair,
    operations: Arc<OperationPool>,
    max_operations: usize,
}

impl ProposalMaker {
    pub fn new(keypair: Keypair, operations: Arc<OperationPool>) -> Self {
        Self {
            keypair,
            operations,
            max_operations: MAX_OPERATIONS_PER_PROPOSAL,
        }
    }

    pub fn with_max_operations(mut self, max: usize) -> Self {
        self.max_operations = max;
        self
    }

    pub fn make(&self, height: Height, round: Round, last_block: Hash) -> Proposal {
        let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.make_at(height, round, last_block, timestamp)
    }

    /// Same as [`ProposalMaker::make`] with an explicit timestamp.
    pub fn make_at(&self, height: Height, round: Round, last_block: Hash, timestamp: u64) -> Proposal {
        let operations = self.operations.peek(self.max_operations);
        Proposal::sign(height, round, last_block, operations, timestamp, &self.keypair)
    }
}

// ---------------------------------------------------------------------------
// ProposalValidator
// ---------------------------------------------------------------------------

/// Turns an acceptable proposal into the next block.
///
/// Must be deterministic: every correct node computes the same block from
/// the same proposal and home state.
pub trait ProposalValidator: Send + Sync + fmt::Debug {
    fn validate(&self, proposal: &Proposal, home: &HomeState) -> Result<Block, ProposalError>;
}

/// Checks signature, height, parent linkage and size, then builds the block
/// verbatim from the proposal.
#[derive(Debug, Clone)]
pub struct DefaultProposalValidator {
    pub max_operations: usize,
}

impl Default for DefaultProposalValidator {
    fn default() -> Self {
        Self {
            max_operations: MAX_OPERATIONS_PER_PROPOSAL,
        }
    }
}

impl ProposalValidator for DefaultProposalValidator {
    fn validate(&self, proposal: &Proposal, home: &HomeState) -> Result<Block, ProposalError> {
        proposal.verify()?;
        if proposal.height != home.height {
            return Err(ProposalError::HeightMismatch {
                expected: home.height,
                got: proposal.height,
            });
        }
        if proposal.last_block != home.last_block {
            return Err(ProposalError::LastBlockMismatch {
                expected: home.last_block,
                got: proposal.last_block,
            });
        }
        if proposal.operations.len() > self.max_operations {
            return Err(ProposalError::TooManyOperations {
                count: proposal.operations.len(),
                limit: self.max_operations,
            });
        }

        Ok(Block::new(
            proposal.height,
            proposal.round,
            proposal.last_block,
            proposal.hash,
            proposal.proposer.clone(),
            proposal.timestamp,
            proposal.operations.clone(),
        ))
    }
}

// ---------------------------------------------------------------------------
// ProposalPool
// ---------------------------------------------------------------------------

/// Verified proposals from designated proposers, one per (height, round).
#[derive(Debug, Default)]
pub struct ProposalPool {
    proposals: DashMap<(Height, Round), Proposal>,
}

impl ProposalPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the first proposal seen for its (height, round). Returns `false`
    /// if a proposal was already pooled there.
    pub fn insert(&self, proposal: Proposal) -> bool {
        let key = (proposal.height, proposal.round);
        let mut inserted = false;
        self.proposals.entry(key).or_insert_with(|| {
            inserted = true;
            proposal
        });
        inserted
    }

    pub fn get(&self, height: Height, round: Round) -> Option<Proposal> {
        self.proposals.get(&(height, round)).map(|p| p.value().clone())
    }

    pub fn hash_at(&self, height: Height, round: Round) -> Option<Hash> {
        self.proposals.get(&(height, round)).map(|p| p.value().hash)
    }

    /// Drop every proposal below `height`.
    pub fn prune_below(&self, height: Height) -> usize {
        let before = self.proposals.len();
        self.proposals.retain(|(h, _), _| *h >= height);
        let removed = before.saturating_sub(self.proposals.len());
        if removed > 0 {
            debug!(below = height, removed, "pruned proposal pool");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }
}
