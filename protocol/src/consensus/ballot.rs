//! # Ballots
//!
//! A ballot is one validator's signed vote for one stage of one round:
//!
//! ```text
//! Ballot
//! ├── body: BallotBody
//! │   ├── stage        INIT | SIGN | ACCEPT
//! │   ├── height       height being decided
//! │   ├── round        current round at that height
//! │   ├── last_block   hash of the block at height - 1
//! │   ├── last_round   round in which last_block was agreed
//! │   ├── next_block   computed block hash (SIGN, ACCEPT)
//! │   └── proposal     proposal hash (SIGN, ACCEPT)
//! ├── node             sender address (base58 of signer)
//! ├── signer           Ed25519 public key
//! └── signature        over BALLOT_DOMAIN || body || node
//! ```
//!
//! The hash a ballot votes for depends on its stage: INIT votes for the
//! previous block (agreeing on where the chain stands), SIGN and ACCEPT vote
//! for the next block computed from the round's proposal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::BALLOT_DOMAIN;
use crate::crypto::{Address, Hash, Keypair, PublicKey, Signature};

/// Block slot number.
pub type Height = u64;

/// Retry counter within a height. Resets to 0 on every new height.
pub type Round = u64;

/// Structural problems with a ballot, independent of suffrage context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BallotError {
    #[error("{stage} ballot is missing {field}")]
    MissingField { stage: Stage, field: &'static str },

    #[error("ballot node {node} does not match its signer key")]
    SignerMismatch { node: Address },

    #[error("ballot signature does not verify")]
    BadSignature,

    #[error("unknown stage: {0}")]
    UnknownStage(String),
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Phase within a round. Ordered INIT < SIGN < ACCEPT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Init,
    Sign,
    Accept,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Init, Stage::Sign, Stage::Accept];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::Sign => "SIGN",
            Stage::Accept => "ACCEPT",
        }
    }

    /// The stage that follows within the same round, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Init => Some(Stage::Sign),
            Stage::Sign => Some(Stage::Accept),
            Stage::Accept => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Stage::Init => 1,
            Stage::Sign => 2,
            Stage::Accept => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = BallotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INIT" => Ok(Stage::Init),
            "SIGN" => Ok(Stage::Sign),
            "ACCEPT" => Ok(Stage::Accept),
            _ => Err(BallotError::UnknownStage(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// BucketKey
// ---------------------------------------------------------------------------

/// Identifies one tally bucket in the ballotbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub height: Height,
    pub round: Round,
    pub stage: Stage,
}

impl BucketKey {
    pub fn new(height: Height, round: Round, stage: Stage) -> Self {
        Self {
            height,
            round,
            stage,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.round, self.stage)
    }
}

// ---------------------------------------------------------------------------
// BallotBody
// ---------------------------------------------------------------------------

/// The unsigned content of a ballot. Built by a ballot maker, then signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotBody {
    pub stage: Stage,
    pub height: Height,
    pub round: Round,
    pub last_block: Hash,
    pub last_round: Round,
    pub next_block: Option<Hash>,
    pub proposal: Option<Hash>,
}

impl BallotBody {
    /// Check that the fields required by the stage are present.
    pub fn check_shape(&self) -> Result<(), BallotError> {
        if self.stage == Stage::Init {
            return Ok(());
        }
        if self.next_block.is_none() {
            return Err(BallotError::MissingField {
                stage: self.stage,
                field: "next_block",
            });
        }
        if self.proposal.is_none() {
            return Err(BallotError::MissingField {
                stage: self.stage,
                field: "proposal",
            });
        }
        Ok(())
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.push(self.stage.tag());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.round.to_le_bytes());
        out.extend_from_slice(self.last_block.as_bytes());
        out.extend_from_slice(&self.last_round.to_le_bytes());
        for field in [&self.next_block, &self.proposal] {
            match field {
                Some(h) => {
                    out.push(1);
                    out.extend_from_slice(h.as_bytes());
                }
                None => out.push(0),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ballot
// ---------------------------------------------------------------------------

/// A signed ballot. Immutable once signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub body: BallotBody,
    pub node: Address,
    pub signer: PublicKey,
    pub signature: Signature,
}

impl Ballot {
    /// Sign `body` as the node owning `keypair`.
    pub fn sign(body: BallotBody, keypair: &Keypair) -> Self {
        let node = keypair.address();
        let payload = signing_payload(&body, &node);
        Self {
            signature: keypair.sign(&payload),
            signer: keypair.public_key(),
            node,
            body,
        }
    }

    /// Verify shape, signer/address binding and signature.
    pub fn verify(&self) -> Result<(), BallotError> {
        self.body.check_shape()?;
        if !self.node.matches(&self.signer) {
            return Err(BallotError::SignerMismatch {
                node: self.node.clone(),
            });
        }
        let payload = signing_payload(&self.body, &self.node);
        if !self.signer.verify(&payload, &self.signature) {
            return Err(BallotError::BadSignature);
        }
        Ok(())
    }

    /// The hash this ballot votes for.
    ///
    /// INIT ballots vote for the previous block; SIGN and ACCEPT ballots
    /// vote for the next block. Shape-checked ballots always have one.
    pub fn voting_hash(&self) -> Option<Hash> {
        match self.body.stage {
            Stage::Init => Some(self.body.last_block),
            Stage::Sign | Stage::Accept => self.body.next_block,
        }
    }

    /// Content hash of the signed payload. Identifies the ballot in logs.
    pub fn hash(&self) -> Hash {
        Hash::digest(&signing_payload(&self.body, &self.node))
    }

    pub fn stage(&self) -> Stage {
        self.body.stage
    }

    pub fn height(&self) -> Height {
        self.body.height
    }

    pub fn round(&self) -> Round {
        self.body.round
    }

    pub fn bucket(&self) -> BucketKey {
        BucketKey::new(self.body.height, self.body.round, self.body.stage)
    }
}

fn signing_payload(body: &BallotBody, node: &Address) -> Vec<u8> {
    let mut out = Vec::with_capacity(BALLOT_DOMAIN.len() + 160);
    out.extend_from_slice(BALLOT_DOMAIN);
    body.write_payload(&mut out);
    out.extend_from_slice(node.as_str().as_bytes());
    out
}
