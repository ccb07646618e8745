//! # State Handlers
//!
//! The consensus state machine as a closed set of handlers. Exactly one is
//! active at a time; the [`StateController`](super::controller::StateController)
//! owns it and performs every swap.
//!
//! ```text
//!            ┌──────────┐ storage ok ┌─────────────┐  same height  ┌───────────┐
//!  start ──► │ Booting  │──────────► │ JoinNetwork │─────────────► │ Consensus │◄─┐
//!            └────┬─────┘            └──────┬──────┘               └─────┬─────┘  │ next round
//!                 │ corrupt                 │ behind                     │        │ / height
//!                 ▼                         ▼                behind      ├────────┘
//!            ┌──────────┐            ┌─────────────┐ ◄──────────────────┘
//!            │ Stopped  │            │   Syncing   │
//!            └──────────┘            └──────┬──────┘
//!                                           │ caught up
//!                                           └──────────► JoinNetwork
//! ```
//!
//! Handlers never swap themselves. They return a [`Transition`] and the
//! controller retires the old handler (cancelling its timers by bumping the
//! epoch) before entering the new one.

mod booting;
mod consensus;
mod join;
mod stopped;
mod syncing;

pub use booting::BootingHandler;
pub use consensus::ConsensusHandler;
pub use join::JoinHandler;
pub use stopped::StoppedHandler;
pub use syncing::SyncingHandler;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::ballot::{Ballot, Height, Round, Stage};
use super::ballotbox::VoteResult;
use super::context::HandlerContext;
use super::home::{HomeState, NodeState};
use super::maker::BallotInputs;
use super::proposal::Proposal;
use super::suffrage::{ActingSuffrage, SuffrageError};
use super::timer::{TimerKind, Timers};
use crate::crypto::Hash;
use crate::network::Seal;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("suffrage error: {0}")]
    Suffrage(#[from] SuffrageError),
}

/// What a handler asks the controller to do next. `Ok(None)` means stay.
pub type HandlerResult = Result<Option<Transition>, HandlerError>;

/// A requested handler swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Join,
    /// Enter consensus, optionally replaying the verdict that triggered it.
    Consensus(Option<VoteResult>),
    /// Catch up until the working height reaches `target`.
    Syncing {
        target: Height,
        vote_result: Option<VoteResult>,
    },
    Stopped {
        reason: String,
    },
}

impl Transition {
    pub fn node_state(&self) -> NodeState {
        match self {
            Transition::Join => NodeState::JoinNetwork,
            Transition::Consensus(_) => NodeState::Consensus,
            Transition::Syncing { .. } => NodeState::Syncing,
            Transition::Stopped { .. } => NodeState::Stopped,
        }
    }

    pub(crate) fn syncing_to(vr: &VoteResult) -> Self {
        Transition::Syncing {
            target: sync_target(vr),
            vote_result: Some(vr.clone()),
        }
    }
}

/// Working height a node must reach to take part in the round `vr`
/// concluded. An ACCEPT majority at H means H is final, so the node must
/// hold it and work on H + 1. INIT and SIGN majorities at H mean H - 1 is
/// final.
pub(crate) fn sync_target(vr: &VoteResult) -> Height {
    match vr.stage {
        Stage::Accept => vr.height + 1,
        Stage::Init | Stage::Sign => vr.height,
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// What a handler may touch during one callback: the shared context and
/// the timers of the current epoch.
pub struct Scope<'a> {
    pub ctx: &'a HandlerContext,
    timers: &'a mut Timers,
    epoch: u64,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(ctx: &'a HandlerContext, timers: &'a mut Timers, epoch: u64) -> Self {
        Self { ctx, timers, epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Arm `kind` to fire `after` from now, replacing any earlier deadline.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        let deadline = self.ctx.clock.now() + after;
        self.timers.arm(kind, deadline, self.epoch);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.timers.cancel(kind);
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    pub fn home(&self) -> HomeState {
        self.ctx.home.snapshot()
    }

    /// Syncing transition for a node whose block source already holds a
    /// block at or beyond the ballot window. Seals from that far ahead are
    /// dropped by the compiler, so no verdict would ever tell us.
    pub fn beyond_window(&self) -> Option<Transition> {
        let home = self.home();
        let highest = match self.ctx.block_source.highest() {
            Ok(highest) => highest?,
            Err(e) => {
                debug!(node = %self.ctx.node, error = %e, "block source height unavailable");
                return None;
            }
        };
        if highest < home.height.saturating_add(self.ctx.policy.max_height_ahead) {
            return None;
        }
        info!(
            node = %self.ctx.node,
            height = home.height,
            network = highest,
            "block source is beyond the ballot window"
        );
        Some(Transition::Syncing {
            target: highest + 1,
            vote_result: None,
        })
    }

    pub fn acting(&self, height: Height, round: Round) -> Result<ActingSuffrage, SuffrageError> {
        let validators = self.ctx.validators.read();
        self.ctx.suffrage.acting(height, round, &validators)
    }

    /// Hand `seal` to the transport. Failures are logged; periodic
    /// re-broadcast makes up for a lost send.
    pub fn broadcast(&self, seal: Seal) {
        if let Err(e) = self.ctx.transport.broadcast(&seal) {
            warn!(node = %self.ctx.node, hint = seal.hint(), error = %e, "broadcast failed");
        }
    }

    /// Build, sign and broadcast this node's ballot for `stage`.
    pub fn send_ballot(
        &self,
        stage: Stage,
        round: Round,
        next_block: Option<Hash>,
        proposal: Option<Hash>,
    ) -> Ballot {
        let home = self.home();
        let inputs = BallotInputs {
            last_block: home.last_block,
            last_round: home.last_round,
            next_height: home.height,
            next_block,
            current_round: round,
            proposal,
        };
        let ballot = self.ctx.ballot_maker.make(stage, &inputs);
        self.broadcast(Seal::Ballot(ballot.clone()));
        ballot
    }
}

// ---------------------------------------------------------------------------
// HandlerState
// ---------------------------------------------------------------------------

/// The active handler.
#[derive(Debug)]
pub enum HandlerState {
    Booting(BootingHandler),
    Join(JoinHandler),
    Consensus(ConsensusHandler),
    Syncing(SyncingHandler),
    Stopped(StoppedHandler),
}

impl From<Transition> for HandlerState {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Join => HandlerState::Join(JoinHandler::new()),
            Transition::Consensus(vr) => HandlerState::Consensus(ConsensusHandler::new(vr)),
            Transition::Syncing {
                target,
                vote_result,
            } => HandlerState::Syncing(SyncingHandler::new(target, vote_result)),
            Transition::Stopped { reason } => HandlerState::Stopped(StoppedHandler::new(reason)),
        }
    }
}

impl HandlerState {
    pub fn node_state(&self) -> NodeState {
        match self {
            HandlerState::Booting(_) => NodeState::Booting,
            HandlerState::Join(_) => NodeState::JoinNetwork,
            HandlerState::Consensus(_) => NodeState::Consensus,
            HandlerState::Syncing(_) => NodeState::Syncing,
            HandlerState::Stopped(_) => NodeState::Stopped,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, HandlerState::Stopped(_))
    }

    pub(crate) fn enter(&mut self, scope: &mut Scope<'_>) -> HandlerResult {
        scope.ctx.home.set_node_state(self.node_state());
        match self {
            HandlerState::Booting(h) => h.enter(scope),
            HandlerState::Join(h) => h.enter(scope),
            HandlerState::Consensus(h) => h.enter(scope),
            HandlerState::Syncing(h) => h.enter(scope),
            HandlerState::Stopped(h) => h.enter(scope),
        }
    }

    pub(crate) fn exit(&mut self, scope: &mut Scope<'_>) {
        if let HandlerState::Consensus(h) = self {
            h.exit(scope);
        }
    }

    pub(crate) fn on_vote(&mut self, scope: &mut Scope<'_>, vr: &VoteResult) -> HandlerResult {
        match self {
            HandlerState::Join(h) => h.on_vote(scope, vr),
            HandlerState::Consensus(h) => h.on_vote(scope, vr),
            HandlerState::Syncing(h) => h.on_vote(scope, vr),
            HandlerState::Booting(_) | HandlerState::Stopped(_) => Ok(None),
        }
    }

    pub(crate) fn on_proposal(
        &mut self,
        scope: &mut Scope<'_>,
        proposal: &Proposal,
    ) -> HandlerResult {
        match self {
            HandlerState::Consensus(h) => h.on_proposal(scope, proposal),
            _ => Ok(None),
        }
    }

    pub(crate) fn on_timer(&mut self, scope: &mut Scope<'_>, kind: TimerKind) -> HandlerResult {
        match self {
            HandlerState::Join(h) => h.on_timer(scope, kind),
            HandlerState::Consensus(h) => h.on_timer(scope, kind),
            HandlerState::Syncing(h) => h.on_timer(scope, kind),
            HandlerState::Booting(_) | HandlerState::Stopped(_) => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the handler tests.

    use std::sync::Arc;

    use crate::consensus::context::{ContextBuilder, HandlerContext};
    use crate::consensus::policy::Policy;
    use crate::consensus::suffrage::ValidatorSet;
    use crate::consensus::timer::ManualClock;
    use crate::crypto::{Hash, Keypair};
    use crate::network::{PeerBlockSource, RecordingTransport};
    use crate::storage::{Block, BlockStore, MemoryBlockStore};

    pub fn keys(n: u8) -> Vec<Keypair> {
        (1..=n).map(|i| Keypair::from_seed(&[i; 32])).collect()
    }

    /// Extend `store` with deterministic blocks up to `tip`.
    pub fn chain(store: &MemoryBlockStore, tip: u64) {
        let proposer = Keypair::from_seed(&[1u8; 32]).address();
        let from = store.last_height().expect("read").map_or(1, |h| h + 1);
        for h in from..=tip {
            let parent = store.block(h - 1).expect("read").expect("parent");
            let block = Block::new(
                h,
                0,
                parent.hash(),
                Hash::digest(&h.to_le_bytes()),
                proposer.clone(),
                h,
                vec![],
            );
            store.commit(&block).expect("commit");
        }
    }

    pub struct Fixture {
        pub keys: Vec<Keypair>,
        pub ctx: Arc<HandlerContext>,
        pub store: Arc<MemoryBlockStore>,
        pub transport: Arc<RecordingTransport>,
        pub clock: Arc<ManualClock>,
        pub peers: Arc<PeerBlockSource>,
    }

    /// Node 0 of four validators, store holding blocks `0..=tip`.
    pub fn fixture(tip: u64) -> Fixture {
        let keys = keys(4);
        let store = Arc::new(MemoryBlockStore::with_genesis());
        chain(&store, tip);
        let transport = Arc::new(RecordingTransport::new());
        let clock = Arc::new(ManualClock::new());
        let peers = Arc::new(PeerBlockSource::new());
        let ctx = ContextBuilder::new(
            keys[0].clone(),
            ValidatorSet::from_keys(keys.iter().map(Keypair::public_key)).into_shared(),
            store.clone(),
            transport.clone(),
        )
        .policy(Policy {
            threshold_percent: 67,
            ..Policy::default()
        })
        .clock(clock.clone())
        .block_source(peers.clone())
        .build()
        .expect("context");
        Fixture {
            ctx: Arc::new(ctx),
            keys,
            store,
            transport,
            clock,
            peers,
        }
    }
}
