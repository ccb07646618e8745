//! # Consensus
//!
//! Drives one round at a time through INIT, SIGN and ACCEPT.
//!
//! ```text
//!  start_round(r)
//!    ├─ broadcast INIT(h, r), arm BroadcastInit + RoundTimeout
//!    └─ proposer? make + broadcast proposal
//!
//!  proposal(h, r) valid ──► next_block, broadcast SIGN
//!  INIT majority ────────► init_agreed; block known? ACCEPT : arm WaitProposal
//!  SIGN majority ────────► block matches? ACCEPT
//!  ACCEPT majority ──────► commit ──► home.height += 1 ──► start_round(0)
//!  draw / timeout ───────► start_round(r + 1)
//!  majority above us ────► Syncing
//! ```
//!
//! A handler reacts to each concluded bucket once: live results carry
//! `concluded_now`, and buckets that concluded before the round started
//! are replayed from the ballotbox when it starts.

use tracing::{debug, info, warn};

use super::{HandlerError, HandlerResult, Scope, Transition};
use crate::consensus::ballot::{BucketKey, Height, Round, Stage};
use crate::consensus::ballotbox::{Verdict, VoteResult};
use crate::consensus::proposal::Proposal;
use crate::consensus::timer::TimerKind;
use crate::crypto::Hash;
use crate::network::Seal;
use crate::storage::Block;

/// Where the round goes after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Stay,
    Round(Round),
    Leave(Transition),
}

#[derive(Debug)]
pub struct ConsensusHandler {
    entry: Option<VoteResult>,
    height: Height,
    round: Round,
    init_agreed: bool,
    proposal: Option<Proposal>,
    next_block: Option<Block>,
    accept_sent: bool,
    pending_commit: Option<Block>,
    commit_failures: u32,
}

impl ConsensusHandler {
    pub fn new(entry: Option<VoteResult>) -> Self {
        Self {
            entry,
            height: 0,
            round: 0,
            init_agreed: false,
            proposal: None,
            next_block: None,
            accept_sent: false,
            pending_commit: None,
            commit_failures: 0,
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    /// The block this node expects to finalize in the current round.
    pub fn next_block(&self) -> Option<&Block> {
        self.next_block.as_ref()
    }

    pub(super) fn enter(&mut self, scope: &mut Scope<'_>) -> HandlerResult {
        let home = scope.home();
        let round = match self.entry.take() {
            Some(vr) if vr.height == home.height => {
                debug!(bucket = %vr.key(), verdict = vr.verdict.as_str(), "entering consensus");
                vr.round.max(home.round)
            }
            _ => home.round,
        };
        self.start_round(scope, round)
    }

    pub(super) fn exit(&mut self, scope: &mut Scope<'_>) {
        if let Some(block) = &self.pending_commit {
            warn!(
                node = %scope.ctx.node,
                height = block.height(),
                "leaving consensus with an uncommitted block"
            );
        }
    }

    pub(super) fn on_vote(&mut self, scope: &mut Scope<'_>, vr: &VoteResult) -> HandlerResult {
        if !vr.concluded_now {
            return Ok(None);
        }
        let step = self.route(scope, vr)?;
        self.drive(scope, step)
    }

    pub(super) fn on_proposal(
        &mut self,
        scope: &mut Scope<'_>,
        proposal: &Proposal,
    ) -> HandlerResult {
        self.handle_proposal(scope, proposal);
        let step = self.replay(scope)?;
        self.drive(scope, step)
    }

    pub(super) fn on_timer(&mut self, scope: &mut Scope<'_>, kind: TimerKind) -> HandlerResult {
        let step = match kind {
            TimerKind::BroadcastInit => {
                scope.send_ballot(Stage::Init, self.round, None, None);
                scope.arm(kind, scope.ctx.policy.interval_broadcasting_init());
                Step::Stay
            }
            TimerKind::BroadcastAccept => {
                self.send_accept(scope, true);
                Step::Stay
            }
            TimerKind::RoundTimeout | TimerKind::WaitProposal => {
                if self.pending_commit.is_some() {
                    Step::Stay
                } else if let Some(transition) = scope.beyond_window() {
                    Step::Leave(transition)
                } else {
                    info!(
                        node = %scope.ctx.node,
                        height = self.height,
                        round = self.round,
                        timer = %kind,
                        "round timed out"
                    );
                    if let Some(metrics) = &scope.ctx.metrics {
                        metrics.round_changes.inc();
                    }
                    Step::Round(self.round + 1)
                }
            }
            TimerKind::CommitRetry => match self.pending_commit.take() {
                Some(block) => self.commit(scope, block),
                None => Step::Stay,
            },
            TimerKind::SyncRetry => Step::Stay,
        };
        self.drive(scope, step)
    }

    // -----------------------------------------------------------------------
    // Rounds
    // -----------------------------------------------------------------------

    fn drive(&mut self, scope: &mut Scope<'_>, step: Step) -> HandlerResult {
        match step {
            Step::Stay => Ok(None),
            Step::Round(round) => self.start_round(scope, round),
            Step::Leave(transition) => Ok(Some(transition)),
        }
    }

    fn start_round(&mut self, scope: &mut Scope<'_>, mut round: Round) -> HandlerResult {
        loop {
            self.reset(scope, round)?;
            match self.replay(scope)? {
                Step::Stay => return Ok(None),
                Step::Round(next) => round = next,
                Step::Leave(transition) => return Ok(Some(transition)),
            }
        }
    }

    fn reset(&mut self, scope: &mut Scope<'_>, round: Round) -> Result<(), HandlerError> {
        let home = scope.home();
        self.height = home.height;
        self.round = round;
        self.init_agreed = false;
        self.proposal = None;
        self.next_block = None;
        self.accept_sent = false;
        self.pending_commit = None;
        self.commit_failures = 0;

        scope.ctx.home.set_round(round);
        if let Some(metrics) = &scope.ctx.metrics {
            metrics.position(self.height, round);
        }
        for kind in [
            TimerKind::WaitProposal,
            TimerKind::BroadcastAccept,
            TimerKind::CommitRetry,
        ] {
            scope.cancel(kind);
        }

        scope.send_ballot(Stage::Init, round, None, None);
        scope.arm(
            TimerKind::BroadcastInit,
            scope.ctx.policy.interval_broadcasting_init(),
        );
        scope.arm(
            TimerKind::RoundTimeout,
            scope.ctx.policy.timeout_waiting_ballot(),
        );

        let acting = scope.acting(self.height, round)?;
        info!(
            node = %scope.ctx.node,
            height = self.height,
            round,
            proposer = %acting.proposer,
            "round started"
        );

        if let Some(pooled) = scope.ctx.proposals.get(self.height, round) {
            self.handle_proposal(scope, &pooled);
        } else if acting.is_proposer(&scope.ctx.node) {
            let proposal = scope
                .ctx
                .proposal_maker
                .make(self.height, round, home.last_block);
            info!(
                height = self.height,
                round,
                hash = %proposal.hash,
                operations = proposal.operations.len(),
                "proposing"
            );
            scope.ctx.proposals.insert(proposal.clone());
            scope.broadcast(Seal::Proposal(proposal.clone()));
            self.handle_proposal(scope, &proposal);
        }
        Ok(())
    }

    /// Re-apply buckets that concluded before this round was ready for
    /// them, then look for evidence that the network has moved on.
    fn replay(&mut self, scope: &mut Scope<'_>) -> Result<Step, HandlerError> {
        for stage in Stage::ALL {
            let key = BucketKey::new(self.height, self.round, stage);
            if let Some(vr) = scope.ctx.ballotbox.concluded(key) {
                let step = self.apply(scope, &vr);
                if step != Step::Stay {
                    return Ok(step);
                }
            }
        }

        if self.pending_commit.is_some() {
            return Ok(Step::Stay);
        }
        let mut ahead = Step::Stay;
        for vr in scope.ctx.ballotbox.concluded_from(self.height) {
            if vr.height > self.height && vr.majority().is_some() {
                return Ok(Step::Leave(Transition::syncing_to(&vr)));
            }
            if vr.height == self.height && vr.round > self.round {
                ahead = Step::Round(vr.round);
            }
        }
        Ok(ahead)
    }

    /// Where a freshly concluded bucket sends us.
    fn route(&mut self, scope: &mut Scope<'_>, vr: &VoteResult) -> Result<Step, HandlerError> {
        if vr.height > self.height {
            if vr.majority().is_some() {
                info!(
                    node = %scope.ctx.node,
                    height = self.height,
                    network = vr.height,
                    stage = %vr.stage,
                    "fell behind the network"
                );
                return Ok(Step::Leave(Transition::syncing_to(vr)));
            }
            return Ok(Step::Stay);
        }
        if vr.height < self.height || self.pending_commit.is_some() {
            return Ok(Step::Stay);
        }
        if vr.round > self.round {
            debug!(
                from = self.round,
                to = vr.round,
                bucket = %vr.key(),
                "network is in a later round"
            );
            return Ok(Step::Round(vr.round));
        }
        if vr.round < self.round {
            return Ok(Step::Stay);
        }
        Ok(self.apply(scope, vr))
    }

    fn apply(&mut self, scope: &mut Scope<'_>, vr: &VoteResult) -> Step {
        match vr.verdict {
            Verdict::NotYet => Step::Stay,
            Verdict::Draw => {
                info!(
                    node = %scope.ctx.node,
                    bucket = %vr.key(),
                    voters = vr.voters.len(),
                    "draw, moving to next round"
                );
                if let Some(metrics) = &scope.ctx.metrics {
                    metrics.round_changes.inc();
                }
                Step::Round(self.round + 1)
            }
            Verdict::Majority(hash) => match vr.stage {
                Stage::Init => {
                    self.on_init_agreed(scope, hash);
                    Step::Stay
                }
                Stage::Sign => {
                    if self.next_block_hash() == Some(hash) {
                        self.send_accept(scope, false);
                    } else {
                        debug!(bucket = %vr.key(), agreed = %hash, "SIGN majority for a block we do not hold");
                    }
                    Step::Stay
                }
                Stage::Accept => self.on_accept_agreed(scope, vr, hash),
            },
        }
    }

    fn on_init_agreed(&mut self, scope: &mut Scope<'_>, last_block: Hash) {
        if self.init_agreed {
            return;
        }
        self.init_agreed = true;

        let home = scope.home();
        if last_block != home.last_block {
            warn!(
                node = %scope.ctx.node,
                height = self.height,
                ours = %home.last_block,
                agreed = %last_block,
                "INIT majority disagrees with our last block"
            );
        }

        if self.next_block.is_some() {
            self.send_accept(scope, false);
        } else {
            scope.arm(
                TimerKind::WaitProposal,
                scope.ctx.policy.timeout_waiting_proposal(),
            );
        }
    }

    fn on_accept_agreed(&mut self, scope: &mut Scope<'_>, vr: &VoteResult, hash: Hash) -> Step {
        if self.pending_commit.is_some() {
            return Step::Stay;
        }

        let block = match self.next_block.clone().filter(|b| b.hash() == hash) {
            Some(block) => Some(block),
            None => scope
                .ctx
                .proposals
                .get(self.height, self.round)
                .and_then(|p| {
                    scope
                        .ctx
                        .proposal_validator
                        .validate(&p, &scope.home())
                        .ok()
                })
                .filter(|b| b.hash() == hash),
        };

        match block {
            Some(block) => self.commit(scope, block),
            None => {
                warn!(
                    node = %scope.ctx.node,
                    bucket = %vr.key(),
                    agreed = %hash,
                    "ACCEPT majority for a block we cannot build"
                );
                Step::Leave(Transition::syncing_to(vr))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Proposals and ballots
    // -----------------------------------------------------------------------

    fn handle_proposal(&mut self, scope: &mut Scope<'_>, proposal: &Proposal) {
        if proposal.height != self.height || proposal.round != self.round {
            return;
        }
        if self.proposal.is_some() || self.pending_commit.is_some() {
            return;
        }

        let block = match scope
            .ctx
            .proposal_validator
            .validate(proposal, &scope.home())
        {
            Ok(block) => block,
            Err(e) => {
                warn!(
                    node = %scope.ctx.node,
                    height = proposal.height,
                    round = proposal.round,
                    proposer = %proposal.proposer,
                    error = %e,
                    "rejected proposal"
                );
                return;
            }
        };

        debug!(
            height = self.height,
            round = self.round,
            proposal = %proposal.hash,
            block = %block.hash(),
            "proposal accepted"
        );
        scope.send_ballot(
            Stage::Sign,
            self.round,
            Some(block.hash()),
            Some(proposal.hash),
        );
        self.proposal = Some(proposal.clone());
        self.next_block = Some(block);
        scope.cancel(TimerKind::WaitProposal);

        if self.init_agreed {
            self.send_accept(scope, false);
        }
    }

    /// Broadcast ACCEPT for the expected block. Sent once per round unless
    /// `resend` is set by the rebroadcast timer.
    fn send_accept(&mut self, scope: &mut Scope<'_>, resend: bool) {
        if self.accept_sent && !resend {
            return;
        }
        if resend && !self.accept_sent {
            return;
        }
        let (Some(block), Some(proposal)) = (&self.next_block, &self.proposal) else {
            return;
        };
        scope.send_ballot(
            Stage::Accept,
            self.round,
            Some(block.hash()),
            Some(proposal.hash),
        );
        if !resend {
            debug!(height = self.height, round = self.round, block = %block.hash(), "sent ACCEPT");
        }
        self.accept_sent = true;
        scope.cancel(TimerKind::WaitProposal);
        scope.arm(
            TimerKind::BroadcastAccept,
            scope.ctx.policy.interval_broadcasting_accept(),
        );
    }

    fn next_block_hash(&self) -> Option<Hash> {
        self.next_block.as_ref().map(Block::hash)
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    fn commit(&mut self, scope: &mut Scope<'_>, block: Block) -> Step {
        for kind in [
            TimerKind::RoundTimeout,
            TimerKind::WaitProposal,
            TimerKind::BroadcastInit,
            TimerKind::BroadcastAccept,
        ] {
            scope.cancel(kind);
        }

        let ctx = scope.ctx;
        match ctx.store.commit(&block) {
            Ok(()) => {
                ctx.home.advance(&block);
                let height = ctx.home.height();
                ctx.ballotbox.prune_below(height);
                ctx.proposals.prune_below(height);
                let removed = ctx.operations.remove_committed(&block);
                if let Some(metrics) = &ctx.metrics {
                    metrics.blocks_committed.inc();
                }
                info!(
                    node = %ctx.node,
                    height = block.height(),
                    round = block.header.round,
                    hash = %block.hash(),
                    operations = block.operations.len(),
                    removed,
                    "block committed"
                );
                self.pending_commit = None;
                self.commit_failures = 0;
                Step::Round(0)
            }
            Err(e) => {
                self.commit_failures += 1;
                if let Some(metrics) = &ctx.metrics {
                    metrics.commit_failures.inc();
                }
                warn!(
                    node = %ctx.node,
                    height = block.height(),
                    attempt = self.commit_failures,
                    error = %e,
                    "commit failed"
                );
                if self.commit_failures >= ctx.policy.max_commit_failures {
                    self.pending_commit = None;
                    return Step::Leave(Transition::Syncing {
                        target: block.height() + 1,
                        vote_result: None,
                    });
                }
                self.pending_commit = Some(block);
                scope.arm(
                    TimerKind::CommitRetry,
                    ctx.policy.interval_commit_retry(),
                );
                Step::Stay
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::consensus::ballot::{Ballot, BallotBody};
    use crate::consensus::compiler::{Compiled, VoteCompiler};
    use crate::consensus::home::{HomeState, NodeState};
    use crate::consensus::state::testing::{fixture, Fixture};
    use crate::consensus::timer::Timers;
    use crate::crypto::Keypair;
    use crate::storage::BlockStore;

    struct Round0 {
        f: Fixture,
        compiler: VoteCompiler,
        timers: Timers,
        handler: ConsensusHandler,
    }

    /// Node 0 of four at height 10 (blocks 0..=9 stored), consensus entered.
    fn round0() -> Round0 {
        let f = fixture(9);
        let tip = f.store.block(9).expect("read").expect("tip");
        f.ctx
            .home
            .reset(HomeState::after(&tip, NodeState::Consensus));
        let compiler = VoteCompiler::new(
            f.ctx.home.clone(),
            f.ctx.validators.clone(),
            f.ctx.suffrage.clone(),
            f.ctx.ballotbox.clone(),
            f.ctx.proposals.clone(),
            f.ctx.policy.threshold_percent,
        );
        let mut r = Round0 {
            f,
            compiler,
            timers: Timers::new(),
            handler: ConsensusHandler::new(None),
        };
        let mut scope = Scope::new(&r.f.ctx, &mut r.timers, 1);
        assert!(r.handler.enter(&mut scope).expect("enter").is_none());
        r
    }

    impl Round0 {
        fn proposer(&self, height: Height, round: Round) -> Keypair {
            let acting = self.compiler.acting(height, round).expect("acting");
            self.f
                .keys
                .iter()
                .find(|k| k.address() == acting.proposer)
                .cloned()
                .expect("proposer key")
        }

        fn deliver(&mut self, seal: Seal) -> HandlerResult {
            let compiled = self.compiler.write(&seal).expect("compile");
            let mut scope = Scope::new(&self.f.ctx, &mut self.timers, 1);
            match compiled {
                Compiled::Vote(vr) => self.handler.on_vote(&mut scope, &vr),
                Compiled::Proposal { proposal, .. } => {
                    self.handler.on_proposal(&mut scope, &proposal)
                }
            }
        }

        fn ballot(&self, key: usize, stage: Stage, next_block: Option<Hash>) -> Seal {
            let home = self.f.ctx.home.snapshot();
            let proposal = self.handler.proposal.as_ref().map(|p| p.hash);
            let body = BallotBody {
                stage,
                height: home.height,
                round: self.handler.round,
                last_block: home.last_block,
                last_round: home.last_round,
                next_block,
                proposal: if stage == Stage::Init { None } else { proposal },
            };
            Seal::Ballot(Ballot::sign(body, &self.f.keys[key]))
        }

        fn stages_sent(&self) -> Vec<Stage> {
            self.f
                .transport
                .sent()
                .iter()
                .filter_map(Seal::as_ballot)
                .map(Ballot::stage)
                .collect()
        }
    }

    /// Deliver the round's proposal when node 0 is not the proposer.
    fn with_proposal(r: &mut Round0) {
        if r.handler.proposal.is_none() {
            let key = r.proposer(10, 0);
            let last = r.f.ctx.home.snapshot().last_block;
            let proposal = Proposal::sign(10, 0, last, vec![b"op".to_vec()], 1_000, &key);
            assert!(r.deliver(Seal::Proposal(proposal)).expect("proposal").is_none());
        }
        assert!(r.handler.next_block().is_some());
    }

    #[test]
    fn entering_broadcasts_init_and_arms_timers() {
        let r = round0();
        assert_eq!(r.stages_sent().first(), Some(&Stage::Init));
        assert!(r.timers.is_armed(TimerKind::BroadcastInit));
        assert!(r.timers.is_armed(TimerKind::RoundTimeout));
        assert_eq!(r.handler.height(), 10);
    }

    #[test]
    fn valid_proposal_is_signed() {
        let mut r = round0();
        with_proposal(&mut r);
        assert!(r.stages_sent().contains(&Stage::Sign));
    }

    #[test]
    fn init_majority_with_block_sends_accept_once() {
        let mut r = round0();
        with_proposal(&mut r);
        r.f.transport.take();

        for key in 1..3 {
            let seal = r.ballot(key, Stage::Init, None);
            assert!(r.deliver(seal).expect("init").is_none());
        }
        assert!(r.stages_sent().is_empty());

        let seal = r.ballot(3, Stage::Init, None);
        assert!(r.deliver(seal).expect("init").is_none());
        assert_eq!(r.stages_sent(), vec![Stage::Accept]);

        let seal = r.ballot(0, Stage::Init, None);
        assert!(r.deliver(seal).expect("init").is_none());
        assert_eq!(r.stages_sent(), vec![Stage::Accept]);
    }

    #[test]
    fn init_majority_without_block_waits_for_proposal() {
        let mut r = round0();
        if r.handler.proposal.is_some() {
            // Node 0 proposes this round; nothing to wait for.
            return;
        }
        for key in 1..4 {
            let seal = r.ballot(key, Stage::Init, None);
            r.deliver(seal).expect("init");
        }
        assert!(r.timers.is_armed(TimerKind::WaitProposal));
        assert!(!r.stages_sent().contains(&Stage::Accept));

        with_proposal(&mut r);
        assert!(!r.timers.is_armed(TimerKind::WaitProposal));
        assert!(r.stages_sent().contains(&Stage::Accept));
    }

    #[test]
    fn accept_majority_commits_and_starts_next_height() {
        let mut r = round0();
        with_proposal(&mut r);
        let block = r.handler.next_block().cloned().expect("block");

        for key in 1..4 {
            let seal = r.ballot(key, Stage::Accept, Some(block.hash()));
            assert!(r.deliver(seal).expect("accept").is_none());
        }

        assert_eq!(r.f.store.last_height().expect("height"), Some(10));
        let home = r.f.ctx.home.snapshot();
        assert_eq!(home.height, 11);
        assert_eq!(home.round, 0);
        assert_eq!(home.last_block, block.hash());
        assert_eq!(r.handler.height(), 11);
        assert!(r.f.ctx.ballotbox.concluded_from(0).iter().all(|vr| vr.height >= 11));
    }

    #[test]
    fn draw_moves_to_next_round() {
        let mut r = round0();
        let a = Some(Hash::digest(b"a"));
        let b = Some(Hash::digest(b"b"));
        // ACCEPT ballots need a proposal hash; borrow one.
        r.handler.proposal = Some(Proposal::sign(10, 0, Hash::ZERO, vec![], 0, &r.f.keys[0]));
        for (key, next) in [(0, a), (1, a), (2, b), (3, b)] {
            let seal = r.ballot(key, Stage::Accept, next);
            r.deliver(seal).expect("accept");
        }
        assert_eq!(r.handler.round(), 1);
        assert_eq!(r.f.ctx.home.snapshot().round, 1);
    }

    #[test]
    fn round_timeout_moves_to_next_round() {
        let mut r = round0();
        r.f.clock.advance(r.f.ctx.policy.timeout_waiting_ballot() + Duration::from_millis(1));
        let mut scope = Scope::new(&r.f.ctx, &mut r.timers, 1);
        let next = r
            .handler
            .on_timer(&mut scope, TimerKind::RoundTimeout)
            .expect("timer");
        assert!(next.is_none());
        assert_eq!(r.handler.round(), 1);
    }

    #[test]
    fn round_timeout_syncs_when_peers_are_beyond_the_window() {
        let mut r = round0();
        let window = r.f.ctx.policy.max_height_ahead;
        let peer = std::sync::Arc::new(crate::storage::MemoryBlockStore::with_genesis());
        crate::consensus::state::testing::chain(&peer, 10 + window);
        r.f.peers.add_peer(peer);

        let mut scope = Scope::new(&r.f.ctx, &mut r.timers, 1);
        match r
            .handler
            .on_timer(&mut scope, TimerKind::RoundTimeout)
            .expect("timer")
        {
            Some(Transition::Syncing { target, .. }) => assert_eq!(target, 11 + window),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.handler.round(), 0);
    }

    #[test]
    fn majority_above_goes_syncing() {
        let mut r = round0();
        let mut scope = Scope::new(&r.f.ctx, &mut r.timers, 1);
        let vr = VoteResult {
            height: 12,
            round: 0,
            stage: Stage::Init,
            verdict: Verdict::Majority(Hash::digest(b"B11")),
            voters: Default::default(),
            proposal: None,
            concluded_now: true,
        };
        match r.handler.on_vote(&mut scope, &vr).expect("vote") {
            Some(Transition::Syncing { target, .. }) => assert_eq!(target, 12),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn commit_failure_retries_then_escalates() {
        let mut r = round0();
        with_proposal(&mut r);
        let block = r.handler.next_block().cloned().expect("block");
        r.f.store.fail_next_commits(10);

        for key in 1..4 {
            let seal = r.ballot(key, Stage::Accept, Some(block.hash()));
            assert!(r.deliver(seal).expect("accept").is_none());
        }
        assert_eq!(r.f.ctx.home.height(), 10);
        assert!(r.timers.is_armed(TimerKind::CommitRetry));

        let limit = r.f.ctx.policy.max_commit_failures;
        let mut outcome = None;
        for _ in 1..limit {
            let mut scope = Scope::new(&r.f.ctx, &mut r.timers, 1);
            outcome = r
                .handler
                .on_timer(&mut scope, TimerKind::CommitRetry)
                .expect("retry");
        }
        match outcome {
            Some(Transition::Syncing { target, .. }) => assert_eq!(target, 11),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.f.ctx.home.height(), 10);
    }

    #[test]
    fn commit_retry_succeeds_after_transient_failure() {
        let mut r = round0();
        with_proposal(&mut r);
        let block = r.handler.next_block().cloned().expect("block");
        r.f.store.fail_next_commits(1);

        for key in 1..4 {
            let seal = r.ballot(key, Stage::Accept, Some(block.hash()));
            r.deliver(seal).expect("accept");
        }
        assert_eq!(r.f.ctx.home.height(), 10);

        let mut scope = Scope::new(&r.f.ctx, &mut r.timers, 1);
        r.handler
            .on_timer(&mut scope, TimerKind::CommitRetry)
            .expect("retry");
        assert_eq!(r.f.ctx.home.height(), 11);
    }
}
