//! JoinNetwork: announce ourselves with INIT ballots until the ballotbox
//! tells us where the network is.

use tracing::{debug, info};

use super::{sync_target, HandlerResult, Scope, Transition};
use crate::consensus::ballot::Stage;
use crate::consensus::ballotbox::VoteResult;
use crate::consensus::timer::TimerKind;

#[derive(Debug, Default)]
pub struct JoinHandler;

impl JoinHandler {
    pub fn new() -> Self {
        Self
    }

    pub(super) fn enter(&mut self, scope: &mut Scope<'_>) -> HandlerResult {
        let home = scope.home();
        info!(
            node = %scope.ctx.node,
            height = home.height,
            round = home.round,
            "joining network"
        );
        scope.send_ballot(Stage::Init, home.round, None, None);
        scope.arm(
            TimerKind::BroadcastInit,
            scope.ctx.policy.interval_broadcasting_init(),
        );

        // Buckets that concluded before we got here. Anything at our own
        // height, ACCEPT included, is Consensus work.
        let concluded = scope.ctx.ballotbox.concluded_from(home.height);
        if let Some(ahead) = concluded
            .iter()
            .filter(|vr| vr.height > home.height && vr.majority().is_some())
            .max_by_key(|vr| sync_target(vr))
        {
            return Ok(Some(Transition::syncing_to(ahead)));
        }
        if let Some(current) = concluded.into_iter().rfind(|vr| vr.height == home.height) {
            return Ok(Some(Transition::Consensus(Some(current))));
        }
        Ok(None)
    }

    pub(super) fn on_vote(&mut self, scope: &mut Scope<'_>, vr: &VoteResult) -> HandlerResult {
        if !vr.concluded_now {
            return Ok(None);
        }
        let home = scope.home();
        if vr.height == home.height {
            debug!(bucket = %vr.key(), verdict = vr.verdict.as_str(), "network agreed on our height");
            return Ok(Some(Transition::Consensus(Some(vr.clone()))));
        }
        if vr.majority().is_some() && sync_target(vr) > home.height {
            info!(
                node = %scope.ctx.node,
                height = home.height,
                network = vr.height,
                stage = %vr.stage,
                "network is ahead"
            );
            return Ok(Some(Transition::syncing_to(vr)));
        }
        Ok(None)
    }

    pub(super) fn on_timer(&mut self, scope: &mut Scope<'_>, kind: TimerKind) -> HandlerResult {
        if kind == TimerKind::BroadcastInit {
            if let Some(transition) = scope.beyond_window() {
                return Ok(Some(transition));
            }
            let home = scope.home();
            scope.send_ballot(Stage::Init, home.round, None, None);
            scope.arm(kind, scope.ctx.policy.interval_broadcasting_init());
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::consensus::ballotbox::Verdict;
    use crate::consensus::home::{HomeState, NodeState};
    use crate::consensus::state::testing::fixture;
    use crate::consensus::timer::Timers;
    use crate::crypto::Hash;
    use crate::network::Seal;
    use crate::storage::BlockStore;

    fn vote(height: u64, stage: Stage, verdict: Verdict) -> VoteResult {
        VoteResult {
            height,
            round: 0,
            stage,
            verdict,
            voters: BTreeSet::new(),
            proposal: None,
            concluded_now: true,
        }
    }

    fn positioned(tip: u64) -> crate::consensus::state::testing::Fixture {
        let f = fixture(tip);
        let block = f.store.block(tip).expect("read").expect("tip");
        f.ctx
            .home
            .reset(HomeState::after(&block, NodeState::JoinNetwork));
        f
    }

    #[test]
    fn enter_broadcasts_init_and_arms_rebroadcast() {
        let f = positioned(9);
        let mut timers = Timers::new();
        let mut scope = Scope::new(&f.ctx, &mut timers, 1);

        let next = JoinHandler::new().enter(&mut scope).expect("enter");
        assert!(next.is_none());

        let sent = f.transport.take();
        assert_eq!(sent.len(), 1);
        let Seal::Ballot(ballot) = &sent[0] else {
            panic!("expected a ballot");
        };
        assert_eq!(ballot.stage(), Stage::Init);
        assert_eq!(ballot.height(), 10);
        assert!(timers.is_armed(TimerKind::BroadcastInit));
    }

    #[test]
    fn majority_at_home_height_enters_consensus() {
        let f = positioned(9);
        let mut timers = Timers::new();
        let mut scope = Scope::new(&f.ctx, &mut timers, 1);
        let mut join = JoinHandler::new();

        let init = vote(10, Stage::Init, Verdict::Majority(Hash::digest(b"B9")));
        let next = join.on_vote(&mut scope, &init).expect("vote");
        assert_eq!(next, Some(Transition::Consensus(Some(init))));
    }

    #[test]
    fn accept_majority_at_home_height_enters_consensus() {
        let f = positioned(9);
        let mut timers = Timers::new();
        let mut scope = Scope::new(&f.ctx, &mut timers, 1);
        let mut join = JoinHandler::new();

        let accept = vote(10, Stage::Accept, Verdict::Majority(Hash::digest(b"B10")));
        let next = join.on_vote(&mut scope, &accept).expect("vote");
        assert_eq!(next, Some(Transition::Consensus(Some(accept))));
    }

    #[test]
    fn majority_ahead_goes_syncing() {
        let f = positioned(9);
        let mut timers = Timers::new();
        let mut scope = Scope::new(&f.ctx, &mut timers, 1);
        let mut join = JoinHandler::new();

        let accept = vote(11, Stage::Accept, Verdict::Majority(Hash::digest(b"B11")));
        match join.on_vote(&mut scope, &accept).expect("vote") {
            Some(Transition::Syncing { target, .. }) => assert_eq!(target, 12),
            other => panic!("unexpected {other:?}"),
        }

        let init = vote(14, Stage::Init, Verdict::Majority(Hash::digest(b"B13")));
        match join.on_vote(&mut scope, &init).expect("vote") {
            Some(Transition::Syncing { target, .. }) => assert_eq!(target, 14),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rebroadcast_tick_syncs_when_peers_are_beyond_the_window() {
        let f = positioned(9);
        let window = f.ctx.policy.max_height_ahead;
        let peer = std::sync::Arc::new(crate::storage::MemoryBlockStore::with_genesis());
        crate::consensus::state::testing::chain(&peer, 10 + window - 1);
        f.peers.add_peer(peer.clone());

        let mut timers = Timers::new();
        let mut scope = Scope::new(&f.ctx, &mut timers, 1);
        let mut join = JoinHandler::new();
        let next = join
            .on_timer(&mut scope, TimerKind::BroadcastInit)
            .expect("tick");
        assert!(next.is_none());
        assert_eq!(f.transport.take().len(), 1);

        crate::consensus::state::testing::chain(&peer, 10 + window);
        match join
            .on_timer(&mut scope, TimerKind::BroadcastInit)
            .expect("tick")
        {
            Some(Transition::Syncing {
                target,
                vote_result: None,
            }) => assert_eq!(target, 11 + window),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn repeated_and_unconcluded_results_are_ignored() {
        let f = positioned(9);
        let mut timers = Timers::new();
        let mut scope = Scope::new(&f.ctx, &mut timers, 1);
        let mut join = JoinHandler::new();

        let mut late = vote(10, Stage::Init, Verdict::Majority(Hash::digest(b"B9")));
        late.concluded_now = false;
        assert!(join.on_vote(&mut scope, &late).expect("vote").is_none());

        let pending = VoteResult {
            verdict: Verdict::NotYet,
            concluded_now: false,
            ..late
        };
        assert!(join.on_vote(&mut scope, &pending).expect("vote").is_none());
    }
}
