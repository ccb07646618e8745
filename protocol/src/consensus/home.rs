//! # Home State
//!
//! Where this node stands: the height it is working on, the current round,
//! the last finalized block and which handler is active.
//!
//! `height` is the working height, one above the last committed block. A
//! node that has committed blocks `0..=9` has `height == 10` and
//! `last_block == hash(block 9)`, and its INIT ballots for height 10 vote
//! for that hash.
//!
//! Only the active handler mutates the home state. The compiler and the
//! node's status endpoint read snapshots.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::ballot::{Height, Round};
use crate::crypto::Hash;
use crate::storage::Block;

/// The state machine discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Booting,
    JoinNetwork,
    Consensus,
    Syncing,
    Stopped,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Booting => "booting",
            NodeState::JoinNetwork => "join-network",
            NodeState::Consensus => "consensus",
            NodeState::Syncing => "syncing",
            NodeState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the local node's position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeState {
    /// Working height (last committed height + 1).
    pub height: Height,
    pub round: Round,
    /// Hash of the block at `height - 1`.
    pub last_block: Hash,
    /// Round in which `last_block` was agreed.
    pub last_round: Round,
    pub node_state: NodeState,
}

impl HomeState {
    /// The state before storage has been read.
    pub fn booting() -> Self {
        Self {
            height: 0,
            round: 0,
            last_block: Hash::ZERO,
            last_round: 0,
            node_state: NodeState::Booting,
        }
    }

    /// Home state positioned right after `tip`.
    pub fn after(tip: &Block, node_state: NodeState) -> Self {
        Self {
            height: tip.height() + 1,
            round: 0,
            last_block: tip.hash(),
            last_round: tip.header.round,
            node_state,
        }
    }

    /// Height of the last committed block, if any.
    pub fn committed_height(&self) -> Option<Height> {
        self.height.checked_sub(1)
    }
}

/// Shared, snapshot-consistent cell around [`HomeState`].
#[derive(Debug)]
pub struct HomeStateCell {
    inner: RwLock<HomeState>,
}

impl Default for HomeStateCell {
    fn default() -> Self {
        Self::new(HomeState::booting())
    }
}

impl HomeStateCell {
    pub fn new(state: HomeState) -> Self {
        Self {
            inner: RwLock::new(state),
        }
    }

    pub fn snapshot(&self) -> HomeState {
        self.inner.read().clone()
    }

    pub fn height(&self) -> Height {
        self.inner.read().height
    }

    pub fn node_state(&self) -> NodeState {
        self.inner.read().node_state
    }

    /// Replace the whole state. Only the Booting handler does this, once
    /// storage has been read.
    pub fn reset(&self, state: HomeState) {
        *self.inner.write() = state;
    }

    pub fn set_node_state(&self, state: NodeState) {
        self.inner.write().node_state = state;
    }

    pub fn set_round(&self, round: Round) {
        self.inner.write().round = round;
    }

    /// Move past a newly committed `block`.
    ///
    /// Returns `false` and leaves the state untouched when `block` would not
    /// move the height forward. Height never decreases.
    pub fn advance(&self, block: &Block) -> bool {
        let mut state = self.inner.write();
        if block.height() < state.height {
            return false;
        }
        state.height = block.height() + 1;
        state.round = 0;
        state.last_block = block.hash();
        state.last_round = block.header.round;
        true
    }
}
