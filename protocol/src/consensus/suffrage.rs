//! # Suffrage
//!
//! Maps `(height, round)` onto the acting member set and designated proposer
//! for that round. Every correct node computes the same answer from the same
//! validator set without exchanging messages, so selection must be a pure
//! function of its inputs:
//!
//! - the validator list is always indexed in address order, never insertion
//!   order;
//! - arithmetic selectors reduce modulo the *current* validator count.
//!
//! Strategies are trait objects. New selection policies plug in without
//! touching the compiler or the state handlers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ballot::{Height, Round};
use crate::config::{ACTING_ALL, SUFFRAGE_DOMAIN};
use crate::crypto::{Address, Hash, PublicKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SuffrageError {
    #[error("validator set is empty")]
    EmptyValidatorSet,

    #[error("fixed proposer {0} is not in the validator set")]
    ProposerNotMember(Address),
}

// ---------------------------------------------------------------------------
// Validator Set
// ---------------------------------------------------------------------------

/// The full set of suffrage members, keyed and ordered by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorSet {
    members: BTreeMap<Address, PublicKey>,
}

/// Read-mostly handle shared by suffrage, compiler and handlers.
/// Mutate only between rounds.
pub type SharedValidators = Arc<RwLock<ValidatorSet>>;

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys<I: IntoIterator<Item = PublicKey>>(keys: I) -> Self {
        let mut set = Self::new();
        for key in keys {
            set.add(key);
        }
        set
    }

    /// Adds a validator. Returns false if it was already present.
    pub fn add(&mut self, key: PublicKey) -> bool {
        self.members
            .insert(Address::from_public_key(&key), key)
            .is_none()
    }

    /// Removes a validator by address. Returns false if it was absent.
    pub fn remove(&mut self, address: &Address) -> bool {
        self.members.remove(address).is_some()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains_key(address)
    }

    pub fn public_key(&self, address: &Address) -> Option<&PublicKey> {
        self.members.get(address)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Addresses in ascending order.
    pub fn addresses(&self) -> Vec<Address> {
        self.members.keys().cloned().collect()
    }

    pub fn into_shared(self) -> SharedValidators {
        Arc::new(RwLock::new(self))
    }
}

// ---------------------------------------------------------------------------
// Acting Suffrage
// ---------------------------------------------------------------------------

/// Who acts in one round: the proposer and the ordered voting members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActingSuffrage {
    pub height: Height,
    pub round: Round,
    pub proposer: Address,
    pub members: Vec<Address>,
}

impl ActingSuffrage {
    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    pub fn is_proposer(&self, address: &Address) -> bool {
        &self.proposer == address
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Suffrage trait
// ---------------------------------------------------------------------------

/// A deterministic acting-suffrage selector.
pub trait Suffrage: Send + Sync + fmt::Debug {
    /// Short policy name for logs and status output.
    fn name(&self) -> &'static str;

    fn acting(
        &self,
        height: Height,
        round: Round,
        validators: &ValidatorSet,
    ) -> Result<ActingSuffrage, SuffrageError>;
}

/// Serializable suffrage selection, used by configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SuffrageKind {
    /// One node always proposes. `None` picks the lowest address.
    FixedProposer { proposer: Option<Address> },
    #[default]
    RoundRobin,
    FullMembership,
}

impl SuffrageKind {
    /// Instantiate the selector. `number_of_acting` of 0 means all validators.
    pub fn build(
        &self,
        validators: &ValidatorSet,
        number_of_acting: usize,
    ) -> Result<Arc<dyn Suffrage>, SuffrageError> {
        Ok(match self {
            SuffrageKind::FixedProposer { proposer } => {
                let proposer = match proposer {
                    Some(p) => p.clone(),
                    None => validators
                        .addresses()
                        .into_iter()
                        .next()
                        .ok_or(SuffrageError::EmptyValidatorSet)?,
                };
                Arc::new(FixedProposerSuffrage::new(proposer, number_of_acting))
            }
            SuffrageKind::RoundRobin => Arc::new(RoundRobinSuffrage::new(number_of_acting)),
            SuffrageKind::FullMembership => Arc::new(FullMembershipSuffrage),
        })
    }
}

fn acting_size(requested: usize, available: usize) -> usize {
    if requested == ACTING_ALL || requested >= available {
        available
    } else {
        requested
    }
}

fn index_for(value: u128, len: usize) -> usize {
    (value % len as u128) as usize
}

// ---------------------------------------------------------------------------
// Fixed proposer
// ---------------------------------------------------------------------------

/// One node always proposes; the rest follow address order with the
/// proposer moved to the front.
#[derive(Debug, Clone)]
pub struct FixedProposerSuffrage {
    proposer: Address,
    number_of_acting: usize,
}

impl FixedProposerSuffrage {
    pub fn new(proposer: Address, number_of_acting: usize) -> Self {
        Self {
            proposer,
            number_of_acting,
        }
    }
}

impl Suffrage for FixedProposerSuffrage {
    fn name(&self) -> &'static str {
        "fixed-proposer"
    }

    fn acting(
        &self,
        height: Height,
        round: Round,
        validators: &ValidatorSet,
    ) -> Result<ActingSuffrage, SuffrageError> {
        if validators.is_empty() {
            return Err(SuffrageError::EmptyValidatorSet);
        }
        if !validators.contains(&self.proposer) {
            return Err(SuffrageError::ProposerNotMember(self.proposer.clone()));
        }

        let size = acting_size(self.number_of_acting, validators.len());
        let mut members = Vec::with_capacity(size);
        members.push(self.proposer.clone());
        members.extend(
            validators
                .addresses()
                .into_iter()
                .filter(|a| a != &self.proposer)
                .take(size - 1),
        );

        Ok(ActingSuffrage {
            height,
            round,
            proposer: self.proposer.clone(),
            members,
        })
    }
}

// ---------------------------------------------------------------------------
// Round robin
// ---------------------------------------------------------------------------

/// Proposer is `validators[(height + round) mod N]`; acting members are the
/// next `number_of_acting` validators starting at the proposer, wrapping.
#[derive(Debug, Clone, Default)]
pub struct RoundRobinSuffrage {
    number_of_acting: usize,
}

impl RoundRobinSuffrage {
    pub fn new(number_of_acting: usize) -> Self {
        Self { number_of_acting }
    }

    /// Index of the proposer in the address-sorted validator list.
    pub fn proposer_index(height: Height, round: Round, len: usize) -> usize {
        index_for(height as u128 + round as u128, len)
    }
}

impl Suffrage for RoundRobinSuffrage {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn acting(
        &self,
        height: Height,
        round: Round,
        validators: &ValidatorSet,
    ) -> Result<ActingSuffrage, SuffrageError> {
        let sorted = validators.addresses();
        if sorted.is_empty() {
            return Err(SuffrageError::EmptyValidatorSet);
        }

        let n = sorted.len();
        let start = Self::proposer_index(height, round, n);
        let size = acting_size(self.number_of_acting, n);
        let members = (0..size).map(|i| sorted[(start + i) % n].clone()).collect();

        Ok(ActingSuffrage {
            height,
            round,
            proposer: sorted[start].clone(),
            members,
        })
    }
}

// ---------------------------------------------------------------------------
// Full membership
// ---------------------------------------------------------------------------

/// Every validator acts in every round; only the proposer rotates, picked by
/// a hash of `(height, round)` so consecutive heights do not walk the list
/// in order.
#[derive(Debug, Clone, Default)]
pub struct FullMembershipSuffrage;

impl Suffrage for FullMembershipSuffrage {
    fn name(&self) -> &'static str {
        "full-membership"
    }

    fn acting(
        &self,
        height: Height,
        round: Round,
        validators: &ValidatorSet,
    ) -> Result<ActingSuffrage, SuffrageError> {
        let members = validators.addresses();
        if members.is_empty() {
            return Err(SuffrageError::EmptyValidatorSet);
        }

        let seed = Hash::of_parts(
            SUFFRAGE_DOMAIN,
            &[&height.to_le_bytes(), &round.to_le_bytes()],
        );
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&seed.as_bytes()[..8]);
        let index = index_for(u64::from_le_bytes(prefix) as u128, members.len());

        Ok(ActingSuffrage {
            height,
            round,
            proposer: members[index].clone(),
            members,
        })
    }
}
