//! # Handler Context
//!
//! Everything a validator's handlers share, built once at startup and passed
//! by reference. There is no global registry: codecs, hash domains, the
//! suffrage selector and every collaborator are fields here.
//!
//! ```text
//! ContextBuilder::new(keypair, validators, store, transport)
//!     .policy(policy)            // default: Policy::default()
//!     .suffrage(kind)            // default: round-robin
//!     .clock(clock)              // default: SystemClock
//!     .block_source(source)      // default: no peers
//!     .metrics(registry)         // default: none
//!     .build()?
//! ```

use std::sync::Arc;

use thiserror::Error;

use super::ballotbox::Ballotbox;
use super::home::HomeStateCell;
use super::maker::{BallotMaker, SignedBallotMaker};
use super::metrics::ConsensusMetrics;
use super::policy::{Policy, PolicyError};
use super::proposal::{
    DefaultProposalValidator, OperationPool, ProposalMaker, ProposalPool, ProposalValidator,
};
use super::suffrage::{SharedValidators, Suffrage, SuffrageError, SuffrageKind};
use super::timer::{Clock, SystemClock};
use crate::crypto::{Address, Keypair};
use crate::network::{BlockSource, PeerBlockSource, Transport};
use crate::storage::BlockStore;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("suffrage error: {0}")]
    Suffrage(#[from] SuffrageError),

    #[error("node {0} is not in the validator set")]
    NotValidator(Address),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Shared collaborators of one validator.
#[derive(Debug)]
pub struct HandlerContext {
    pub node: Address,
    pub policy: Policy,
    pub home: Arc<HomeStateCell>,
    pub validators: SharedValidators,
    pub suffrage: Arc<dyn Suffrage>,
    pub ballotbox: Arc<Ballotbox>,
    pub proposals: Arc<ProposalPool>,
    pub operations: Arc<OperationPool>,
    pub ballot_maker: Arc<dyn BallotMaker>,
    pub proposal_maker: ProposalMaker,
    pub proposal_validator: Arc<dyn ProposalValidator>,
    pub store: Arc<dyn BlockStore>,
    pub block_source: Arc<dyn BlockSource>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Option<ConsensusMetrics>,
}

/// Builder for [`HandlerContext`]. Validates the policy and instantiates
/// the suffrage selector.
pub struct ContextBuilder {
    keypair: Keypair,
    validators: SharedValidators,
    store: Arc<dyn BlockStore>,
    transport: Arc<dyn Transport>,
    policy: Policy,
    suffrage: SuffrageKind,
    clock: Arc<dyn Clock>,
    block_source: Arc<dyn BlockSource>,
    ballot_maker: Option<Arc<dyn BallotMaker>>,
    proposal_validator: Arc<dyn ProposalValidator>,
    operations: Arc<OperationPool>,
    home: Arc<HomeStateCell>,
    registry: Option<prometheus::Registry>,
}

impl ContextBuilder {
    pub fn new(
        keypair: Keypair,
        validators: SharedValidators,
        store: Arc<dyn BlockStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            keypair,
            validators,
            store,
            transport,
            policy: Policy::default(),
            suffrage: SuffrageKind::default(),
            clock: Arc::new(SystemClock),
            block_source: Arc::new(PeerBlockSource::new()),
            ballot_maker: None,
            proposal_validator: Arc::new(DefaultProposalValidator::default()),
            operations: Arc::new(OperationPool::new()),
            home: Arc::new(HomeStateCell::default()),
            registry: None,
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn suffrage(mut self, kind: SuffrageKind) -> Self {
        self.suffrage = kind;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn block_source(mut self, source: Arc<dyn BlockSource>) -> Self {
        self.block_source = source;
        self
    }

    /// Replace the honest ballot maker, e.g. with a faulty one.
    pub fn ballot_maker(mut self, maker: Arc<dyn BallotMaker>) -> Self {
        self.ballot_maker = Some(maker);
        self
    }

    pub fn proposal_validator(mut self, validator: Arc<dyn ProposalValidator>) -> Self {
        self.proposal_validator = validator;
        self
    }

    pub fn operations(mut self, pool: Arc<OperationPool>) -> Self {
        self.operations = pool;
        self
    }

    /// Share an existing home cell, e.g. with a status endpoint.
    pub fn home(mut self, home: Arc<HomeStateCell>) -> Self {
        self.home = home;
        self
    }

    pub fn metrics(mut self, registry: prometheus::Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<HandlerContext, ContextError> {
        self.policy.validate()?;

        let node = self.keypair.address();
        let suffrage = {
            let validators = self.validators.read();
            if !validators.contains(&node) {
                return Err(ContextError::NotValidator(node));
            }
            self.suffrage
                .build(&validators, self.policy.number_of_acting)?
        };

        let metrics = match &self.registry {
            Some(registry) => Some(ConsensusMetrics::register(registry, node.as_str())?),
            None => None,
        };

        let ballot_maker = self
            .ballot_maker
            .unwrap_or_else(|| Arc::new(SignedBallotMaker::new(self.keypair.clone())));
        let proposal_maker = ProposalMaker::new(self.keypair, Arc::clone(&self.operations));

        Ok(HandlerContext {
            node,
            policy: self.policy,
            home: self.home,
            validators: self.validators,
            suffrage,
            ballotbox: Arc::new(Ballotbox::new()),
            proposals: Arc::new(ProposalPool::new()),
            operations: self.operations,
            ballot_maker,
            proposal_maker,
            proposal_validator: self.proposal_validator,
            store: self.store,
            block_source: self.block_source,
            transport: self.transport,
            clock: self.clock,
            metrics,
        })
    }
}
