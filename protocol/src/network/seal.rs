//! Seals: the signed messages validators exchange.
//!
//! A seal is either a ballot, a proposal, or something this node does not
//! understand. Unknown seals still decode (their hint is preserved) so the
//! compiler can reject them with a typed error instead of the codec
//! guessing.

use serde::{Deserialize, Serialize};

use crate::consensus::ballot::{Ballot, Height, Round};
use crate::consensus::proposal::Proposal;
use crate::crypto::Hash;

pub const BALLOT_HINT: &str = "ballot";
pub const PROPOSAL_HINT: &str = "proposal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seal {
    Ballot(Ballot),
    Proposal(Proposal),
    Unknown { hint: String, body: Vec<u8> },
}

impl Seal {
    pub fn hint(&self) -> &str {
        match self {
            Seal::Ballot(_) => BALLOT_HINT,
            Seal::Proposal(_) => PROPOSAL_HINT,
            Seal::Unknown { hint, .. } => hint,
        }
    }

    /// Content hash, for logs and deduplication.
    pub fn hash(&self) -> Hash {
        match self {
            Seal::Ballot(b) => b.hash(),
            Seal::Proposal(p) => p.hash,
            Seal::Unknown { body, .. } => Hash::digest(body),
        }
    }

    pub fn position(&self) -> Option<(Height, Round)> {
        match self {
            Seal::Ballot(b) => Some((b.height(), b.round())),
            Seal::Proposal(p) => Some((p.height, p.round)),
            Seal::Unknown { .. } => None,
        }
    }

    pub fn as_ballot(&self) -> Option<&Ballot> {
        match self {
            Seal::Ballot(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_proposal(&self) -> Option<&Proposal> {
        match self {
            Seal::Proposal(p) => Some(p),
            _ => None,
        }
    }
}

impl From<Ballot> for Seal {
    fn from(ballot: Ballot) -> Self {
        Seal::Ballot(ballot)
    }
}

impl From<Proposal> for Seal {
    fn from(proposal: Proposal) -> Self {
        Seal::Proposal(proposal)
    }
}
