//! # State Controller
//!
//! Owns the active handler and is the only place a handler is swapped.
//!
//! ```text
//!  dispatch(seal) ──► VoteCompiler::write ──► handler.on_vote / on_proposal
//!  fire_timer(t)  ──► epoch == current? ───► handler.on_timer
//!                                 │
//!                     Some(Transition) returned
//!                                 ▼
//!           retire old: exit, clear timers, epoch += 1, live -= 1
//!           enter new:  live += 1, handler.enter (may chain)
//! ```
//!
//! A swap is synchronous: no seal or timer reaches any handler while one
//! is in progress, and the epoch bump makes every timer armed by the old
//! handler a no-op.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::ballotbox::VoteResult;
use super::compiler::{CompileError, Compiled, VoteCompiler};
use super::context::HandlerContext;
use super::home::NodeState;
use super::state::{BootingHandler, HandlerResult, HandlerState, Scope, Transition};
use super::timer::{TimerFired, Timers};
use crate::config::MAX_CHAINED_TRANSITIONS;
use crate::network::Seal;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller has not been started")]
    NotStarted,

    #[error("controller already started")]
    AlreadyStarted,

    #[error("seal rejected: {0}")]
    Compile(#[from] CompileError),

    #[error("more than {limit} chained transitions for one event")]
    TransitionLoop { limit: usize },

    #[error("{live} handlers live during a swap")]
    HandlerOverlap { live: usize },
}

/// Holds exactly one active handler.
#[derive(Debug)]
pub struct StateController {
    ctx: Arc<HandlerContext>,
    compiler: VoteCompiler,
    state: Option<HandlerState>,
    timers: Timers,
    epoch: u64,
    live_handlers: usize,
}

impl StateController {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        let mut compiler = VoteCompiler::new(
            Arc::clone(&ctx.home),
            Arc::clone(&ctx.validators),
            Arc::clone(&ctx.suffrage),
            Arc::clone(&ctx.ballotbox),
            Arc::clone(&ctx.proposals),
            ctx.policy.threshold_percent,
        )
        .with_max_height_ahead(ctx.policy.max_height_ahead);
        if let Some(metrics) = &ctx.metrics {
            compiler = compiler.with_metrics(metrics.clone());
        }
        Self {
            ctx,
            compiler,
            state: None,
            timers: Timers::new(),
            epoch: 0,
            live_handlers: 0,
        }
    }

    /// Install the Booting handler and follow its transitions.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.state.is_some() {
            return Err(ControllerError::AlreadyStarted);
        }
        info!(node = %self.ctx.node, "starting consensus");
        self.install(HandlerState::Booting(BootingHandler::new()))
    }

    /// Move to Stopped. Idempotent.
    pub fn stop(&mut self) -> Result<(), ControllerError> {
        match &self.state {
            Some(state) if state.is_stopped() => Ok(()),
            _ => self.request_transition(Transition::Stopped {
                reason: "stop requested".into(),
            }),
        }
    }

    /// Swap to the handler for `transition`.
    pub fn request_transition(&mut self, transition: Transition) -> Result<(), ControllerError> {
        if self.state.is_none() && !matches!(transition, Transition::Stopped { .. }) {
            return Err(ControllerError::NotStarted);
        }
        self.install(transition.into())
    }

    /// Compile `seal` and hand the outcome to the active handler.
    ///
    /// Returns the vote result for ballots. Rejections come back as
    /// [`ControllerError::Compile`] and leave every piece of state as it was.
    pub fn dispatch(&mut self, seal: &Seal) -> Result<Option<VoteResult>, ControllerError> {
        match &self.state {
            None => return Err(ControllerError::NotStarted),
            Some(state) if state.is_stopped() => return Ok(None),
            Some(_) => {}
        }

        let compiled = self.compiler.write(seal).map_err(|e| {
            if e.is_benign() {
                debug!(node = %self.ctx.node, reason = e.reason(), error = %e, "seal ignored");
            } else {
                warn!(node = %self.ctx.node, reason = e.reason(), error = %e, "seal rejected");
            }
            e
        })?;

        let Some(state) = self.state.as_mut() else {
            return Err(ControllerError::NotStarted);
        };
        let mut scope = Scope::new(&self.ctx, &mut self.timers, self.epoch);
        let (result, vote) = match compiled {
            Compiled::Vote(vr) => (state.on_vote(&mut scope, &vr), Some(vr)),
            Compiled::Proposal { proposal, fresh } => {
                if fresh {
                    (state.on_proposal(&mut scope, &proposal), None)
                } else {
                    (Ok(None), None)
                }
            }
        };
        self.follow(result)?;
        Ok(vote)
    }

    /// Deliver one due timer. Returns `false` for a timer armed under an
    /// earlier epoch, which is dropped.
    pub fn fire_timer(&mut self, fired: TimerFired) -> Result<bool, ControllerError> {
        if fired.epoch != self.epoch {
            debug!(timer = %fired.kind, armed = fired.epoch, current = self.epoch, "stale timer dropped");
            return Ok(false);
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(false);
        };
        let mut scope = Scope::new(&self.ctx, &mut self.timers, self.epoch);
        let result = state.on_timer(&mut scope, fired.kind);
        self.follow(result)?;
        Ok(true)
    }

    /// Fire every timer due by the context clock. Returns how many reached
    /// a handler.
    ///
    /// Each due timer is claimed right before delivery, so one that an
    /// earlier delivery cancelled, re-armed or cleared with a swap is skipped.
    pub fn poll_timers(&mut self) -> Result<usize, ControllerError> {
        let due = self.timers.due(self.ctx.clock.now());
        let mut delivered = 0;
        for timer in due {
            let Some(fired) = self.timers.take(timer) else {
                debug!(timer = %timer.kind(), "timer disarmed before delivery");
                continue;
            };
            if self.fire_timer(fired)? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn state(&self) -> Option<&HandlerState> {
        self.state.as_ref()
    }

    pub fn node_state(&self) -> Option<NodeState> {
        self.state.as_ref().map(HandlerState::node_state)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Handlers currently entered and not retired. 1 after `start`.
    pub fn live_handlers(&self) -> usize {
        self.live_handlers
    }

    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.ctx
    }

    pub fn compiler(&self) -> &VoteCompiler {
        &self.compiler
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    // -----------------------------------------------------------------------
    // Swaps
    // -----------------------------------------------------------------------

    fn follow(&mut self, result: HandlerResult) -> Result<(), ControllerError> {
        match result {
            Ok(None) => Ok(()),
            Ok(Some(transition)) => self.install(transition.into()),
            Err(e) => {
                warn!(node = %self.ctx.node, error = %e, "handler error");
                Ok(())
            }
        }
    }

    fn install(&mut self, mut next: HandlerState) -> Result<(), ControllerError> {
        for _ in 0..MAX_CHAINED_TRANSITIONS {
            match self.swap(next)? {
                None => return Ok(()),
                Some(transition) => next = transition.into(),
            }
        }

        error!(
            node = %self.ctx.node,
            limit = MAX_CHAINED_TRANSITIONS,
            "transition loop, stopping"
        );
        self.swap(HandlerState::from(Transition::Stopped {
            reason: "transition loop".into(),
        }))?;
        Err(ControllerError::TransitionLoop {
            limit: MAX_CHAINED_TRANSITIONS,
        })
    }

    /// Retire the active handler and enter `next`. Returns the transition
    /// `next` asked for on entry, if any.
    fn swap(&mut self, mut next: HandlerState) -> Result<Option<Transition>, ControllerError> {
        let from = self.node_state();
        if let Some(mut old) = self.state.take() {
            let mut scope = Scope::new(&self.ctx, &mut self.timers, self.epoch);
            old.exit(&mut scope);
            self.live_handlers = self.live_handlers.saturating_sub(1);
        }
        self.timers.clear();
        self.epoch += 1;

        if self.live_handlers != 0 {
            return Err(ControllerError::HandlerOverlap {
                live: self.live_handlers,
            });
        }

        let to = next.node_state();
        if let Some(metrics) = &self.ctx.metrics {
            metrics.transition(to);
        }
        info!(
            node = %self.ctx.node,
            from = from.map(|s| s.as_str()).unwrap_or("none"),
            to = to.as_str(),
            epoch = self.epoch,
            "state transition"
        );

        self.live_handlers += 1;
        let mut scope = Scope::new(&self.ctx, &mut self.timers, self.epoch);
        let entered = next.enter(&mut scope);
        self.state = Some(next);

        match entered {
            Ok(transition) => Ok(transition),
            Err(e) => {
                error!(node = %self.ctx.node, state = to.as_str(), error = %e, "handler failed to enter");
                if to == NodeState::Stopped {
                    Ok(None)
                } else {
                    Ok(Some(Transition::Stopped {
                        reason: e.to_string(),
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::consensus::ballot::{Ballot, BallotBody, Stage};
    use crate::consensus::ballotbox::Verdict;
    use crate::consensus::proposal::Proposal;
    use crate::consensus::state::testing::{fixture, Fixture};
    use crate::consensus::timer::{Clock, TimerKind};
    use crate::crypto::Hash;
    use crate::storage::BlockStore;

    fn started(tip: u64) -> (Fixture, StateController) {
        let f = fixture(tip);
        let mut controller = StateController::new(Arc::clone(&f.ctx));
        controller.start().expect("start");
        (f, controller)
    }

    fn init(f: &Fixture, controller: &StateController, key: usize) -> Seal {
        let home = controller.context().home.snapshot();
        Seal::Ballot(Ballot::sign(
            BallotBody {
                stage: Stage::Init,
                height: home.height,
                round: home.round,
                last_block: home.last_block,
                last_round: home.last_round,
                next_block: None,
                proposal: None,
            },
            &f.keys[key],
        ))
    }

    #[test]
    fn start_boots_into_join() {
        let (_f, controller) = started(9);
        assert_eq!(controller.node_state(), Some(NodeState::JoinNetwork));
        assert_eq!(controller.live_handlers(), 1);
        assert_eq!(controller.context().home.height(), 10);
        assert_eq!(
            controller.context().home.node_state(),
            NodeState::JoinNetwork
        );
    }

    #[test]
    fn start_twice_is_an_error() {
        let (_f, mut controller) = started(0);
        assert!(matches!(
            controller.start(),
            Err(ControllerError::AlreadyStarted)
        ));
    }

    #[test]
    fn dispatch_before_start_is_an_error() {
        let f = fixture(0);
        let mut controller = StateController::new(Arc::clone(&f.ctx));
        let seal = init(&f, &controller, 1);
        assert!(matches!(
            controller.dispatch(&seal),
            Err(ControllerError::NotStarted)
        ));
    }

    #[test]
    fn init_majority_moves_join_to_consensus() {
        let (f, mut controller) = started(9);
        for key in 1..4 {
            let seal = init(&f, &controller, key);
            controller.dispatch(&seal).expect("dispatch");
        }
        assert_eq!(controller.node_state(), Some(NodeState::Consensus));
        assert_eq!(controller.live_handlers(), 1);
    }

    #[test]
    fn stale_timer_is_a_no_op() {
        let (f, mut controller) = started(9);
        let old_epoch = controller.epoch();
        assert!(controller.timers().is_armed(TimerKind::BroadcastInit));

        for key in 1..4 {
            let seal = init(&f, &controller, key);
            controller.dispatch(&seal).expect("dispatch");
        }
        assert!(controller.epoch() > old_epoch);

        let fired = controller
            .fire_timer(TimerFired {
                kind: TimerKind::RoundTimeout,
                epoch: old_epoch,
            })
            .expect("fire");
        assert!(!fired);
        assert_eq!(controller.context().home.snapshot().round, 0);
    }

    #[test]
    fn poll_fires_due_timers_by_clock() {
        let (f, mut controller) = started(9);
        f.transport.take();
        assert_eq!(controller.poll_timers().expect("poll"), 0);

        f.clock
            .advance(controller.context().policy.interval_broadcasting_init() + Duration::from_millis(1));
        assert_eq!(controller.poll_timers().expect("poll"), 1);
        assert_eq!(f.transport.len(), 1);
    }

    #[test]
    fn timers_due_together_advance_a_single_round() {
        let (f, mut controller) = started(9);
        for key in 1..4 {
            let seal = init(&f, &controller, key);
            controller.dispatch(&seal).expect("dispatch");
        }
        assert_eq!(controller.node_state(), Some(NodeState::Consensus));
        if !controller.timers().is_armed(TimerKind::WaitProposal) {
            // Node 0 proposes at 10/0 and never waits.
            return;
        }

        // Broadcast, proposal wait and round timeout all come due at once.
        f.clock.advance(
            controller.context().policy.timeout_waiting_ballot() + Duration::from_millis(1),
        );
        assert_eq!(controller.poll_timers().expect("poll"), 2);

        assert_eq!(controller.context().home.snapshot().round, 1);
        assert!(!controller.timers().is_armed(TimerKind::WaitProposal));
        let deadline = controller
            .timers()
            .deadline(TimerKind::RoundTimeout)
            .expect("round timeout armed");
        assert!(deadline > f.clock.now());
    }

    #[test]
    fn accept_majority_at_working_height_in_join_commits_pooled_proposal() {
        let (f, mut controller) = started(9);
        assert_eq!(controller.node_state(), Some(NodeState::JoinNetwork));
        let home = controller.context().home.snapshot();

        let proposer = controller.compiler().acting(10, 0).expect("acting").proposer;
        let key = f
            .keys
            .iter()
            .find(|k| k.address() == proposer)
            .cloned()
            .expect("proposer key");
        let proposal = Proposal::sign(10, 0, home.last_block, vec![b"op".to_vec()], 1_000, &key);
        controller
            .dispatch(&Seal::Proposal(proposal.clone()))
            .expect("proposal");
        let block = controller
            .context()
            .proposal_validator
            .validate(&proposal, &home)
            .expect("valid proposal");

        for key in 1..4 {
            let seal = Seal::Ballot(Ballot::sign(
                BallotBody {
                    stage: Stage::Accept,
                    height: 10,
                    round: 0,
                    last_block: home.last_block,
                    last_round: home.last_round,
                    next_block: Some(block.hash()),
                    proposal: Some(proposal.hash),
                },
                &f.keys[key],
            ));
            controller.dispatch(&seal).expect("dispatch");
        }

        assert_eq!(controller.node_state(), Some(NodeState::Consensus));
        assert_eq!(f.store.last_height().expect("height"), Some(10));
        assert_eq!(
            f.store.block(10).expect("read").map(|b| b.hash()),
            Some(block.hash())
        );
        assert_eq!(controller.context().home.height(), 11);
        assert_eq!(controller.live_handlers(), 1);
    }

    #[test]
    fn stop_is_terminal_and_idempotent() {
        let (f, mut controller) = started(9);
        controller.stop().expect("stop");
        controller.stop().expect("stop again");
        assert_eq!(controller.node_state(), Some(NodeState::Stopped));
        assert!(controller.timers().is_empty());
        assert_eq!(controller.live_handlers(), 1);

        let seal = init(&f, &controller, 1);
        assert_eq!(controller.dispatch(&seal).expect("dispatch"), None);
    }

    #[test]
    fn rejected_seal_leaves_state_untouched() {
        let (f, mut controller) = started(9);
        let mut seal = init(&f, &controller, 1);
        if let Seal::Ballot(ballot) = &mut seal {
            ballot.body.last_block = Hash::digest(b"tampered");
        }
        let err = controller.dispatch(&seal).expect_err("rejected");
        assert!(matches!(err, ControllerError::Compile(CompileError::InvalidSignature(_))));
        assert!(controller.context().ballotbox.is_empty());
    }

    #[test]
    fn accept_majority_in_join_triggers_sync_and_catch_up() {
        let (f, mut controller) = started(2);
        let peer = Arc::new(crate::storage::MemoryBlockStore::with_genesis());
        crate::consensus::state::testing::chain(&peer, 6);
        f.peers.add_peer(peer.clone());

        // ACCEPT majority for block 5: the network is at height 6.
        let b4 = peer.block(4).expect("read").expect("b4");
        let b5 = peer.block(5).expect("read").expect("b5");
        for key in 1..4 {
            let seal = Seal::Ballot(Ballot::sign(
                BallotBody {
                    stage: Stage::Accept,
                    height: 5,
                    round: 0,
                    last_block: b4.hash(),
                    last_round: 0,
                    next_block: Some(b5.hash()),
                    proposal: Some(Hash::digest(b"p5")),
                },
                &f.keys[key],
            ));
            let vr = controller.dispatch(&seal).expect("dispatch");
            if key == 3 {
                assert!(matches!(vr.map(|v| v.verdict), Some(Verdict::Majority(_))));
            }
        }

        assert_eq!(f.store.last_height().expect("height"), Some(5));
        assert_eq!(controller.context().home.height(), 6);
        assert_eq!(controller.node_state(), Some(NodeState::JoinNetwork));
        assert_eq!(controller.live_handlers(), 1);
    }
}
