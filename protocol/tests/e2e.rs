//! End-to-end tests for the ISAAC consensus core.
//!
//! These drive real [`StateController`]s through the public API only:
//! signed seals in, ballots out, blocks in storage. Three harnesses:
//!
//! - a single validator fed hand-signed seals, with a recording transport
//!   and a manual clock, for exact step-by-step scenarios;
//! - a simulated four-validator network that delivers encoded seals in a
//!   seeded random order, for safety checks;
//! - real async runtimes on a [`LocalNetwork`], for liveness.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;

use isaac_protocol::consensus::{
    Ballot, BallotBody, CompileError, ConsensusRuntime, ContextBuilder, ControllerError, Fault,
    FaultMatch, FaultRule, FaultyBallotMaker, HandlerState, HomeStateCell, ManualClock, NodeState,
    Policy, Proposal, SignedBallotMaker, Stage, StateController, ValidatorSet, Verdict,
};
use isaac_protocol::crypto::{Hash, Keypair};
use isaac_protocol::network::{
    BincodeCodec, LocalNetwork, PeerBlockSource, RecordingTransport, Seal, SealCodec,
};
use isaac_protocol::storage::{Block, BlockStore, MemoryBlockStore};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Honour `RUST_LOG` when debugging a failing test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn keys(n: u8) -> Vec<Keypair> {
    (1..=n).map(|i| Keypair::from_seed(&[i; 32])).collect()
}

fn validator_set(keys: &[Keypair]) -> ValidatorSet {
    ValidatorSet::from_keys(keys.iter().map(Keypair::public_key))
}

/// A store holding genesis plus blocks `1..=tip`.
fn chain_store(tip: u64) -> Arc<MemoryBlockStore> {
    let store = Arc::new(MemoryBlockStore::with_genesis());
    extend(&store, tip);
    store
}

fn extend(store: &MemoryBlockStore, tip: u64) {
    let proposer = Keypair::from_seed(&[1u8; 32]).address();
    let from = store.last_height().expect("height").map_or(1, |h| h + 1);
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

/// One validator under test: node 0 of four.
struct Single {
    keys: Vec<Keypair>,
    controller: StateController,
    store: Arc<MemoryBlockStore>,
    transport: Arc<RecordingTransport>,
    clock: Arc<ManualClock>,
}

fn single(tip: u64, peers: Vec<Arc<dyn BlockStore>>) -> Single {
    let keys = keys(4);
    let store = chain_store(tip);
    let transport = Arc::new(RecordingTransport::new());
    let clock = Arc::new(ManualClock::new());
    let ctx = ContextBuilder::new(
        keys[0].clone(),
        validator_set(&keys).into_shared(),
        store.clone(),
        transport.clone(),
    )
    .policy(Policy {
        threshold_percent: 67,
        ..Policy::default()
    })
    .clock(clock.clone())
    .block_source(Arc::new(PeerBlockSource::with_peers(peers)))
    .build()
    .expect("context");
    Single {
        keys,
        controller: StateController::new(Arc::new(ctx)),
        store,
        transport,
        clock,
    }
}

impl Single {
    fn home_body(&self, stage: Stage) -> BallotBody {
        let home = self.controller.context().home.snapshot();
        BallotBody {
            stage,
            height: home.height,
            round: home.round,
            last_block: home.last_block,
            last_round: home.last_round,
            next_block: None,
            proposal: None,
        }
    }

    fn init_from(&self, key: usize) -> Seal {
        Seal::Ballot(Ballot::sign(self.home_body(Stage::Init), &self.keys[key]))
    }

    fn sent_ballots(&self, stage: Stage) -> Vec<Ballot> {
        self.transport
            .sent()
            .iter()
            .filter_map(Seal::as_ballot)
            .filter(|b| b.stage() == stage)
            .cloned()
            .collect()
    }

    /// Hand the round's proposal to the node unless it is the proposer.
    fn deliver_proposal(&mut self, height: u64, round: u64) {
        let acting = self.controller.compiler().acting(height, round).expect("acting");
        if acting.proposer == self.keys[0].address() {
            return;
        }
        let key = self
            .keys
            .iter()
            .find(|k| k.address() == acting.proposer)
            .cloned()
            .expect("proposer key");
        let last = self.controller.context().home.snapshot().last_block;
        let proposal = Proposal::sign(height, round, last, vec![b"pay".to_vec()], 1_000, &key);
        let outcome = self.controller.dispatch(&Seal::Proposal(proposal)).expect("proposal");
        assert!(outcome.is_none());
    }

    /// Bring the node from Join into Consensus at its working height with
    /// an ACCEPT on the wire.
    fn reach_accept(&mut self) -> Ballot {
        self.controller.start().expect("start");
        let height = self.controller.context().home.height();
        self.deliver_proposal(height, 0);
        for key in 1..4 {
            let seal = self.init_from(key);
            self.controller.dispatch(&seal).expect("init");
        }
        assert_eq!(self.controller.node_state(), Some(NodeState::Consensus));
        let accepts = self.sent_ballots(Stage::Accept);
        assert_eq!(accepts.len(), 1);
        accepts[0].clone()
    }

    fn echo_accept(&mut self, accept: &Ballot, keys: std::ops::Range<usize>) {
        for key in keys {
            let seal = Seal::Ballot(Ballot::sign(accept.body.clone(), &self.keys[key]));
            self.controller.dispatch(&seal).expect("accept");
        }
    }
}

// ---------------------------------------------------------------------------
// Single validator scenarios
// ---------------------------------------------------------------------------

#[test]
fn round_commits_after_init_and_accept_majorities() {
    let mut s = single(9, vec![]);
    s.controller.start().expect("start");
    assert_eq!(s.controller.node_state(), Some(NodeState::JoinNetwork));
    assert_eq!(s.controller.context().home.height(), 10);
    assert_eq!(s.sent_ballots(Stage::Init).len(), 1);

    s.deliver_proposal(10, 0);
    s.transport.take();

    let seal = s.init_from(1);
    let first = s.controller.dispatch(&seal).expect("init").expect("vote");
    assert_eq!(first.verdict, Verdict::NotYet);
    let seal = s.init_from(2);
    s.controller.dispatch(&seal).expect("init");

    let seal = s.init_from(3);
    let third = s.controller.dispatch(&seal).expect("init").expect("vote");
    let tip = s.store.block(9).expect("read").expect("tip");
    assert_eq!(third.verdict, Verdict::Majority(tip.hash()));
    assert_eq!(third.voters.len(), 3);
    assert!(third.concluded_now);
    assert_eq!(s.controller.node_state(), Some(NodeState::Consensus));
    assert_eq!(s.sent_ballots(Stage::Accept).len(), 1);

    let accept = s.sent_ballots(Stage::Accept)[0].clone();
    let Some(HandlerState::Consensus(handler)) = s.controller.state() else {
        panic!("not in consensus");
    };
    assert_eq!(accept.body.next_block, handler.next_block().map(Block::hash));

    // A late INIT for a concluded bucket triggers nothing new.
    s.transport.take();
    let seal = s.init_from(0);
    let late = s.controller.dispatch(&seal).expect("init").expect("vote");
    assert!(!late.concluded_now);
    assert!(s.sent_ballots(Stage::Accept).is_empty());

    s.echo_accept(&accept, 1..4);

    assert_eq!(s.store.last_height().expect("height"), Some(10));
    assert_eq!(s.controller.context().home.height(), 11);
    assert_eq!(s.controller.node_state(), Some(NodeState::Consensus));
    assert!(s
        .sent_ballots(Stage::Init)
        .iter()
        .any(|b| b.height() == 11 && b.round() == 0));
    assert_eq!(s.controller.live_handlers(), 1);
}

#[test]
fn ballot_below_the_working_height_is_rejected_without_side_effects() {
    let mut s = single(9, vec![]);
    let accept = s.reach_accept();
    s.echo_accept(&accept, 1..4);
    assert_eq!(s.controller.context().home.height(), 11);

    let stale = Seal::Ballot(Ballot::sign(
        BallotBody {
            height: 10,
            ..s.home_body(Stage::Init)
        },
        &s.keys[1],
    ));
    let epoch = s.controller.epoch();
    let home = s.controller.context().home.snapshot();
    s.transport.take();

    let err = s.controller.dispatch(&stale).expect_err("stale");
    assert!(matches!(
        err,
        ControllerError::Compile(CompileError::StaleBallot { height: 10, home: 11 })
    ));
    assert_eq!(s.controller.epoch(), epoch);
    assert_eq!(s.controller.context().home.snapshot(), home);
    assert!(s.transport.is_empty());
}

#[test]
fn forged_ballot_is_refused() {
    let mut s = single(3, vec![]);
    s.controller.start().expect("start");

    let mut ballot = Ballot::sign(s.home_body(Stage::Init), &s.keys[1]);
    ballot.body.last_block = Hash::digest(b"elsewhere");
    let err = s.controller.dispatch(&Seal::Ballot(ballot)).expect_err("forged");
    assert!(matches!(err, ControllerError::Compile(CompileError::InvalidSignature(_))));
    assert_eq!(s.controller.node_state(), Some(NodeState::JoinNetwork));
}

#[test]
fn repeated_commit_failures_hand_over_to_sync() {
    let peer = chain_store(10);
    let mut s = single(9, vec![peer.clone() as Arc<dyn BlockStore>]);
    let accept = s.reach_accept();

    s.store.fail_next_commits(3);
    s.echo_accept(&accept, 1..4);
    assert_eq!(s.controller.node_state(), Some(NodeState::Consensus));
    assert_eq!(s.store.last_height().expect("height"), Some(9));

    for _ in 0..2 {
        s.clock.advance(Duration::from_millis(600));
        s.controller.poll_timers().expect("poll");
    }

    // Escalated to Syncing, which fetched block 10 from the peer and
    // handed over to JoinNetwork at height 11.
    assert_eq!(s.controller.node_state(), Some(NodeState::JoinNetwork));
    assert_eq!(s.store.last_height().expect("height"), Some(10));
    assert_eq!(
        s.store.block(10).expect("read").expect("block").hash(),
        peer.block(10).expect("read").expect("block").hash()
    );
    assert_eq!(s.controller.context().home.height(), 11);
    assert_eq!(s.controller.live_handlers(), 1);
}

#[test]
fn majority_ahead_triggers_catch_up() {
    let peer = chain_store(14);
    let mut s = single(9, vec![peer.clone() as Arc<dyn BlockStore>]);
    s.controller.start().expect("start");

    let tip = peer.block(14).expect("read").expect("tip");
    for key in 1..4 {
        let body = BallotBody {
            stage: Stage::Init,
            height: 15,
            round: 0,
            last_block: tip.hash(),
            last_round: 0,
            next_block: None,
            proposal: None,
        };
        s.controller
            .dispatch(&Seal::Ballot(Ballot::sign(body, &s.keys[key])))
            .expect("init");
    }

    // Caught up to 14, joined at 15, and found the INIT majority there.
    assert_eq!(s.store.last_height().expect("height"), Some(14));
    assert_eq!(s.controller.context().home.height(), 15);
    assert_eq!(s.controller.node_state(), Some(NodeState::Consensus));
}

// ---------------------------------------------------------------------------
// Simulated network with seeded delivery order
// ---------------------------------------------------------------------------

struct SimNode {
    controller: StateController,
    transport: Arc<RecordingTransport>,
    clock: Arc<ManualClock>,
    store: Arc<MemoryBlockStore>,
}

struct Sim {
    nodes: Vec<SimNode>,
    inflight: Vec<(usize, Vec<u8>)>,
    codec: BincodeCodec,
    rng: StdRng,
    tick: Duration,
}

impl Sim {
    /// Four validators with empty stores. `faults[i]` replaces node i's
    /// ballot maker with a faulty one.
    fn new(seed: u64, faults: &[(usize, Vec<FaultRule>)]) -> Self {
        let keys = keys(4);
        let validators = validator_set(&keys).into_shared();
        let stores: Vec<_> = keys.iter().map(|_| Arc::new(MemoryBlockStore::new())).collect();
        let policy = Policy::default();
        let tick = policy.interval_broadcasting_init();

        let nodes = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let peers = stores
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, s)| s.clone() as Arc<dyn BlockStore>)
                    .collect();
                let transport = Arc::new(RecordingTransport::new());
                let clock = Arc::new(ManualClock::new());
                let mut builder = ContextBuilder::new(
                    key.clone(),
                    validators.clone(),
                    stores[i].clone(),
                    transport.clone(),
                )
                .policy(policy.clone())
                .clock(clock.clone())
                .block_source(Arc::new(PeerBlockSource::with_peers(peers)));
                if let Some((_, rules)) = faults.iter().find(|(n, _)| *n == i) {
                    builder = builder.ballot_maker(Arc::new(FaultyBallotMaker::new(
                        SignedBallotMaker::new(key.clone()),
                        rules.clone(),
                    )));
                }
                let ctx = builder.build().expect("context");
                SimNode {
                    controller: StateController::new(Arc::new(ctx)),
                    transport,
                    clock,
                    store: stores[i].clone(),
                }
            })
            .collect();

        let mut sim = Self {
            nodes,
            inflight: Vec::new(),
            codec: BincodeCodec,
            rng: StdRng::seed_from_u64(seed),
            tick,
        };
        for node in &mut sim.nodes {
            node.controller.start().expect("start");
        }
        sim.collect();
        sim
    }

    /// Move everything the nodes broadcast into flight, one copy per node.
    fn collect(&mut self) {
        for node in &self.nodes {
            for seal in node.transport.take() {
                let bytes = self.codec.encode(&seal).expect("encode");
                for to in 0..self.nodes.len() {
                    self.inflight.push((to, bytes.clone()));
                }
            }
        }
    }

    fn step(&mut self) {
        if self.inflight.is_empty() {
            for node in &mut self.nodes {
                node.clock.advance(self.tick);
                node.controller.poll_timers().expect("timers");
            }
        } else {
            let pick = self.rng.gen_range(0..self.inflight.len());
            let (to, bytes) = self.inflight.swap_remove(pick);
            // At-least-once: sometimes deliver a copy again later.
            if self.rng.gen_bool(0.05) {
                self.inflight.push((to, bytes.clone()));
            }
            let seal = self.codec.decode(&bytes).expect("decode");
            match self.nodes[to].controller.dispatch(&seal) {
                Ok(_) | Err(ControllerError::Compile(_)) => {}
                Err(e) => panic!("node {to} failed: {e}"),
            }
        }
        self.collect();
        for (i, node) in self.nodes.iter().enumerate() {
            assert_eq!(node.controller.live_handlers(), 1, "node {i}");
        }
    }

    fn committed(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.store.last_height().expect("height").unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    fn run_until(&mut self, height: u64, max_steps: usize) {
        for _ in 0..max_steps {
            if self.committed() >= height {
                return;
            }
            self.step();
        }
        panic!("stuck below height {height} (at {})", self.committed());
    }

    /// Every node holds the same block at every height it has.
    fn assert_agreement(&self, upto: u64) {
        for h in 1..=upto {
            let hashes: Vec<_> = self
                .nodes
                .iter()
                .map(|n| n.store.block(h).expect("read").expect("block").hash())
                .collect();
            assert!(hashes.windows(2).all(|w| w[0] == w[1]), "fork at {h}: {hashes:?}");
        }
    }
}

#[test]
fn shuffled_delivery_never_forks() {
    init_tracing();
    for seed in 0..6 {
        let mut sim = Sim::new(seed, &[]);
        sim.run_until(4, 50_000);
        sim.assert_agreement(4);
    }
}

#[test]
fn one_byzantine_acceptor_cannot_stop_progress() {
    let faulty = vec![FaultRule {
        on: FaultMatch::Stage {
            stage: Stage::Accept,
        },
        fault: Fault::FabricateNextBlock,
    }];
    let mut sim = Sim::new(42, &[(3, faulty)]);
    sim.run_until(3, 50_000);
    sim.assert_agreement(3);
}

#[test]
fn split_accepts_draw_and_the_next_round_commits() {
    let split = vec![FaultRule {
        on: FaultMatch::Exact {
            height: 1,
            round: 0,
            stage: Stage::Accept,
        },
        fault: Fault::FabricateNextBlock,
    }];
    let mut sim = Sim::new(7, &[(2, split.clone()), (3, split)]);
    sim.run_until(1, 50_000);
    sim.assert_agreement(1);

    let block = sim.nodes[0].store.block(1).expect("read").expect("block");
    assert!(block.header.round >= 1, "committed in round {}", block.header.round);
}

// ---------------------------------------------------------------------------
// Async runtimes on a LocalNetwork
// ---------------------------------------------------------------------------

fn fast_policy() -> Policy {
    Policy {
        timeout_waiting_proposal_ms: 300,
        timeout_waiting_ballot_ms: 600,
        interval_broadcasting_init_ms: 50,
        interval_broadcasting_accept_ms: 50,
        interval_sync_retry_ms: 50,
        interval_commit_retry_ms: 20,
        ..Policy::default()
    }
}

async fn wait_for(homes: &[Arc<HomeStateCell>], committed: u64) {
    loop {
        if homes.iter().all(|h| h.height() > committed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partitioned_validator_catches_up_after_rejoining() {
    init_tracing();
    let keys = keys(4);
    let validators = validator_set(&keys).into_shared();
    let codec: Arc<dyn SealCodec> = Arc::new(BincodeCodec);
    let network = LocalNetwork::new(codec.clone(), 1024);
    let stores: Vec<_> = keys.iter().map(|_| Arc::new(MemoryBlockStore::new())).collect();

    let mut runtimes = Vec::new();
    let mut homes = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let (endpoint, inbound) = network.register(key.address());
        let peers = stores
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, s)| s.clone() as Arc<dyn BlockStore>)
            .collect();
        let home = Arc::new(HomeStateCell::default());
        let ctx = ContextBuilder::new(key.clone(), validators.clone(), stores[i].clone(), Arc::new(endpoint))
            .policy(fast_policy())
            .block_source(Arc::new(PeerBlockSource::with_peers(peers)))
            .home(home.clone())
            .build()
            .expect("context");
        runtimes.push(ConsensusRuntime::new(
            StateController::new(Arc::new(ctx)),
            inbound,
            codec.clone(),
        ));
        homes.push(home);
    }

    network.set_offline(&keys[3].address(), true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks: Vec<_> = runtimes
        .into_iter()
        .map(|r| tokio::spawn(r.run(shutdown_rx.clone())))
        .collect();

    tokio::time::timeout(Duration::from_secs(30), wait_for(&homes[..3], 3))
        .await
        .expect("three validators progress without the fourth");
    assert!(homes[3].height() <= 1);

    network.set_offline(&keys[3].address(), false);
    tokio::time::timeout(Duration::from_secs(30), wait_for(&homes, 5))
        .await
        .expect("rejoined validator catches up");

    shutdown_tx.send(true).expect("shutdown");
    for task in tasks {
        let controller = task.await.expect("join").expect("run");
        assert_eq!(controller.node_state(), Some(NodeState::Stopped));
    }
    for h in 1..=5 {
        let reference = stores[0].block(h).expect("read").expect("block").hash();
        for store in &stores[1..] {
            assert_eq!(store.block(h).expect("read").expect("block").hash(), reference);
        }
    }
}
