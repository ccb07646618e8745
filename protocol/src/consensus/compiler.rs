//! # Vote Compiler
//!
//! Turns raw seals into validated ballots and verdicts. Every inbound seal
//! passes through [`VoteCompiler::write`] before any handler sees it.
//!
//! ## Ballot pipeline
//!
//! ```text
//! seal ──► is it a ballot? ──────────────── no ──► NotBallot
//!            │ yes
//!            ▼
//!        shape + signature ─────────────── bad ──► MalformedBallot / InvalidSignature
//!            ▼
//!        height >= home.height? ─────────── no ──► StaleBallot
//!            ▼
//!        height <= home.height + window? ── no ──► TooFarAhead
//!            ▼
//!        signer in acting suffrage? ─────── no ──► NotActingMember
//!            ▼
//!        SIGN: proposal == pooled one? ──── no ──► ProposalMismatch
//!            ▼
//!        Ballotbox::vote(minimum = threshold(acting.len(), percent))
//!            ▼
//!        VoteResult
//! ```
//!
//! Proposals take a shorter path: signature, height window, designated
//! proposer, then into the [`ProposalPool`]. They produce no verdict.
//!
//! The compiler is not reentrant per bucket by contract: the runtime feeds
//! it from a single consumer, so ballots for one bucket are filed in arrival
//! order.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::ballot::{Ballot, BallotError, Height, Round, Stage};
use super::ballotbox::{Ballotbox, TallyRule, VoteResult};
use super::home::HomeStateCell;
use super::metrics::ConsensusMetrics;
use super::proposal::{Proposal, ProposalError, ProposalPool};
use super::suffrage::{ActingSuffrage, SharedValidators, Suffrage, SuffrageError};
use super::threshold::{Threshold, ThresholdError};
use crate::config::DEFAULT_MAX_HEIGHT_AHEAD;
use crate::crypto::{Address, Hash};
use crate::network::Seal;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("seal with hint {0:?} is not a ballot")]
    NotBallot(String),

    #[error("malformed ballot: {0}")]
    MalformedBallot(BallotError),

    #[error("invalid signature from {0}")]
    InvalidSignature(Address),

    #[error("{node} is not an acting member for {height}/{round}")]
    NotActingMember {
        node: Address,
        height: Height,
        round: Round,
    },

    #[error("{node} is not the proposer for {height}/{round}")]
    NotProposer {
        node: Address,
        height: Height,
        round: Round,
    },

    #[error("SIGN ballot for {height}/{round} carries proposal {got:?}, expected {expected:?}")]
    ProposalMismatch {
        height: Height,
        round: Round,
        expected: Hash,
        got: Option<Hash>,
    },

    #[error("stale seal for height {height} (home is at {home})")]
    StaleBallot { height: Height, home: Height },

    #[error("seal for height {height} is more than {limit} above home {home}")]
    TooFarAhead {
        height: Height,
        home: Height,
        limit: u64,
    },

    #[error("invalid proposal: {0}")]
    InvalidProposal(ProposalError),

    #[error("suffrage error: {0}")]
    Suffrage(#[from] SuffrageError),

    #[error("threshold error: {0}")]
    Threshold(#[from] ThresholdError),
}

impl CompileError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            CompileError::NotBallot(_) => "not-ballot",
            CompileError::MalformedBallot(_) => "malformed",
            CompileError::InvalidSignature(_) => "invalid-signature",
            CompileError::NotActingMember { .. } => "not-acting-member",
            CompileError::NotProposer { .. } => "not-proposer",
            CompileError::ProposalMismatch { .. } => "proposal-mismatch",
            CompileError::StaleBallot { .. } => "stale",
            CompileError::TooFarAhead { .. } => "too-far-ahead",
            CompileError::InvalidProposal(_) => "invalid-proposal",
            CompileError::Suffrage(_) => "suffrage",
            CompileError::Threshold(_) => "threshold",
        }
    }

    /// Expected under normal operation (latency, membership races).
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            CompileError::StaleBallot { .. }
                | CompileError::TooFarAhead { .. }
                | CompileError::NotActingMember { .. }
        )
    }
}

/// What [`VoteCompiler::write`] accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compiled {
    /// A ballot was filed; here is its bucket's verdict.
    Vote(VoteResult),
    /// A proposal was verified and pooled. `fresh` is false for a proposal
    /// already pooled at its (height, round).
    Proposal { proposal: Proposal, fresh: bool },
}

/// Validates seals and feeds the ballotbox.
#[derive(Debug)]
pub struct VoteCompiler {
    home: Arc<HomeStateCell>,
    validators: SharedValidators,
    suffrage: Arc<dyn Suffrage>,
    ballotbox: Arc<Ballotbox>,
    proposals: Arc<ProposalPool>,
    percent: u8,
    max_ahead: u64,
    metrics: Option<ConsensusMetrics>,
}

impl VoteCompiler {
    pub fn new(
        home: Arc<HomeStateCell>,
        validators: SharedValidators,
        suffrage: Arc<dyn Suffrage>,
        ballotbox: Arc<Ballotbox>,
        proposals: Arc<ProposalPool>,
        percent: u8,
    ) -> Self {
        Self {
            home,
            validators,
            suffrage,
            ballotbox,
            proposals,
            percent,
            max_ahead: DEFAULT_MAX_HEIGHT_AHEAD,
            metrics: None,
        }
    }

    /// Drop seals more than `max_ahead` heights above the working height.
    pub fn with_max_height_ahead(mut self, max_ahead: u64) -> Self {
        self.max_ahead = max_ahead;
        self
    }

    pub fn with_metrics(mut self, metrics: ConsensusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate `seal` and file it.
    pub fn write(&self, seal: &Seal) -> Result<Compiled, CompileError> {
        let result = match seal {
            Seal::Ballot(ballot) => self.write_ballot(ballot).map(Compiled::Vote),
            Seal::Proposal(proposal) => self.write_proposal(proposal),
            Seal::Unknown { hint, .. } => Err(CompileError::NotBallot(hint.clone())),
        };

        if let (Err(e), Some(metrics)) = (&result, &self.metrics) {
            metrics.seal_rejected(e.reason());
        }
        result
    }

    fn write_ballot(&self, ballot: &Ballot) -> Result<VoteResult, CompileError> {
        ballot.verify().map_err(|e| match e {
            BallotError::BadSignature | BallotError::SignerMismatch { .. } => {
                CompileError::InvalidSignature(ballot.node.clone())
            }
            other => CompileError::MalformedBallot(other),
        })?;

        self.check_fresh(ballot.height())?;

        let acting = self.acting(ballot.height(), ballot.round())?;
        if !acting.contains(&ballot.node) {
            return Err(CompileError::NotActingMember {
                node: ballot.node.clone(),
                height: ballot.height(),
                round: ballot.round(),
            });
        }

        if ballot.stage() == Stage::Sign {
            if let Some(expected) = self.proposals.hash_at(ballot.height(), ballot.round()) {
                if ballot.body.proposal != Some(expected) {
                    return Err(CompileError::ProposalMismatch {
                        height: ballot.height(),
                        round: ballot.round(),
                        expected,
                        got: ballot.body.proposal,
                    });
                }
            }
        }

        let threshold = Threshold::new(acting.len(), self.percent)?;
        let result = self.ballotbox.vote(
            ballot,
            TallyRule {
                minimum: threshold.minimum(),
                members: &acting.members,
            },
        );

        debug!(
            bucket = %ballot.bucket(),
            node = %ballot.node,
            verdict = result.verdict.as_str(),
            voters = result.voters.len(),
            minimum = threshold.minimum(),
            "ballot filed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.ballot_accepted(ballot.stage());
            if result.concluded_now {
                metrics.verdict(result.stage, &result.verdict);
            }
        }
        Ok(result)
    }

    fn write_proposal(&self, proposal: &Proposal) -> Result<Compiled, CompileError> {
        proposal.verify().map_err(|e| match e {
            ProposalError::BadSignature | ProposalError::SignerMismatch(_) => {
                CompileError::InvalidSignature(proposal.proposer.clone())
            }
            other => CompileError::InvalidProposal(other),
        })?;

        self.check_fresh(proposal.height)?;

        let acting = self.acting(proposal.height, proposal.round)?;
        if !acting.is_proposer(&proposal.proposer) {
            warn!(
                node = %proposal.proposer,
                height = proposal.height,
                round = proposal.round,
                "proposal from non-designated proposer"
            );
            return Err(CompileError::NotProposer {
                node: proposal.proposer.clone(),
                height: proposal.height,
                round: proposal.round,
            });
        }

        let fresh = self.proposals.insert(proposal.clone());
        debug!(
            height = proposal.height,
            round = proposal.round,
            hash = ?proposal.hash,
            fresh,
            "proposal pooled"
        );
        Ok(Compiled::Proposal {
            proposal: proposal.clone(),
            fresh,
        })
    }

    fn check_fresh(&self, height: Height) -> Result<(), CompileError> {
        let home = self.home.height();
        if height < home {
            return Err(CompileError::StaleBallot { height, home });
        }
        if height - home > self.max_ahead {
            return Err(CompileError::TooFarAhead {
                height,
                home,
                limit: self.max_ahead,
            });
        }
        Ok(())
    }

    /// Acting suffrage for (height, round) against the current validator set.
    pub fn acting(&self, height: Height, round: Round) -> Result<ActingSuffrage, CompileError> {
        let validators = self.validators.read();
        Ok(self.suffrage.acting(height, round, &validators)?)
    }

    pub fn ballotbox(&self) -> &Arc<Ballotbox> {
        &self.ballotbox
    }
}
