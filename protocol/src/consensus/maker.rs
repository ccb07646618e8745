//! # Ballot Makers
//!
//! Handlers never sign ballots themselves. They describe where the round
//! stands in a [`BallotInputs`] and ask a [`BallotMaker`] for the ballot of
//! a given stage.
//!
//! [`FaultyBallotMaker`] wraps any maker and rewrites fields before
//! signing, driven by a rule table. It exists to exercise byzantine
//! behaviour in tests and local networks. Rule lookup order:
//!
//! ```text
//!   exact (height, round, stage)  >  height only  >  stage only  >  wildcard
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ballot::{Ballot, BallotBody, Height, Round, Stage};
use crate::crypto::{Address, Hash, Keypair};

/// Everything a maker needs to build a ballot for the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BallotInputs {
    pub last_block: Hash,
    pub last_round: Round,
    pub next_height: Height,
    pub next_block: Option<Hash>,
    pub current_round: Round,
    pub proposal: Option<Hash>,
}

/// Produces signed ballots for this node.
pub trait BallotMaker: Send + Sync + fmt::Debug {
    fn node(&self) -> Address;

    /// The unsigned body for `stage`.
    fn body(&self, stage: Stage, inputs: &BallotInputs) -> BallotBody {
        let carries_block = stage != Stage::Init;
        BallotBody {
            stage,
            height: inputs.next_height,
            round: inputs.current_round,
            last_block: inputs.last_block,
            last_round: inputs.last_round,
            next_block: inputs.next_block.filter(|_| carries_block),
            proposal: inputs.proposal.filter(|_| carries_block),
        }
    }

    fn seal(&self, body: BallotBody) -> Ballot;

    fn make(&self, stage: Stage, inputs: &BallotInputs) -> Ballot {
        self.seal(self.body(stage, inputs))
    }
}

/// The honest maker.
#[derive(Debug, Clone)]
pub struct SignedBallotMaker {
    keypair: Keypair,
}

impl SignedBallotMaker {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }
}

impl BallotMaker for SignedBallotMaker {
    fn node(&self) -> Address {
        self.keypair.address()
    }

    fn seal(&self, body: BallotBody) -> Ballot {
        Ballot::sign(body, &self.keypair)
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Which ballots a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "kebab-case")]
pub enum FaultMatch {
    Exact {
        height: Height,
        round: Round,
        stage: Stage,
    },
    Height { height: Height },
    Stage { stage: Stage },
    Any,
}

impl FaultMatch {
    fn priority(&self) -> u8 {
        match self {
            FaultMatch::Exact { .. } => 3,
            FaultMatch::Height { .. } => 2,
            FaultMatch::Stage { .. } => 1,
            FaultMatch::Any => 0,
        }
    }

    fn matches(&self, body: &BallotBody) -> bool {
        match *self {
            FaultMatch::Exact {
                height,
                round,
                stage,
            } => body.height == height && body.round == round && body.stage == stage,
            FaultMatch::Height { height } => body.height == height,
            FaultMatch::Stage { stage } => body.stage == stage,
            FaultMatch::Any => true,
        }
    }
}

/// What a matching rule does to the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fault {
    /// Replace `next_block` with a made-up hash.
    FabricateNextBlock,
    /// Replace `last_block` with a made-up hash.
    FabricateLastBlock,
    /// Replace `proposal` with a made-up hash.
    FabricateProposal,
    /// Leave the body alone.
    Honest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRule {
    #[serde(flatten)]
    pub on: FaultMatch,
    pub fault: Fault,
}

/// Decorator that corrupts ballots of the wrapped maker per a rule table.
///
/// With an empty table every ballot gets a fabricated `next_block`.
#[derive(Debug, Clone)]
pub struct FaultyBallotMaker<M> {
    inner: M,
    rules: Vec<FaultRule>,
}

impl<M: BallotMaker> FaultyBallotMaker<M> {
    pub fn new(inner: M, rules: Vec<FaultRule>) -> Self {
        Self { inner, rules }
    }

    /// The fault that applies to `body`, honouring rule priority. Among
    /// rules of equal priority the first listed wins.
    pub fn fault_for(&self, body: &BallotBody) -> Fault {
        if self.rules.is_empty() {
            return Fault::FabricateNextBlock;
        }
        let mut best: Option<&FaultRule> = None;
        for rule in self.rules.iter().filter(|r| r.on.matches(body)) {
            if best.map_or(true, |b| rule.on.priority() > b.on.priority()) {
                best = Some(rule);
            }
        }
        best.map_or(Fault::Honest, |r| r.fault)
    }

    fn fabricated(&self, body: &BallotBody, field: &[u8]) -> Hash {
        Hash::of_parts(
            b"faulty-ballot",
            &[
                self.inner.node().as_str().as_bytes(),
                field,
                &body.height.to_le_bytes(),
                &body.round.to_le_bytes(),
                body.stage.as_str().as_bytes(),
            ],
        )
    }
}

impl<M: BallotMaker> BallotMaker for FaultyBallotMaker<M> {
    fn node(&self) -> Address {
        self.inner.node()
    }

    fn body(&self, stage: Stage, inputs: &BallotInputs) -> BallotBody {
        let mut body = self.inner.body(stage, inputs);
        match self.fault_for(&body) {
            Fault::FabricateNextBlock => {
                body.next_block = Some(self.fabricated(&body, b"next_block"));
            }
            Fault::FabricateLastBlock => {
                body.last_block = self.fabricated(&body, b"last_block");
            }
            Fault::FabricateProposal => {
                body.proposal = Some(self.fabricated(&body, b"proposal"));
            }
            Fault::Honest => {}
        }
        body
    }

    fn seal(&self, body: BallotBody) -> Ballot {
        self.inner.seal(body)
    }
}
