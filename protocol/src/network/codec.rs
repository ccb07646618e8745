//! # Seal Codecs
//!
//! Every seal travels inside a small envelope:
//!
//! ```text
//! Envelope { version: u8, hint: String, body: bytes }
//! ```
//!
//! The hint says how to read the body. Known hints (`ballot`, `proposal`)
//! decode to typed seals; unknown hints decode to [`Seal::Unknown`] so the
//! caller decides what to do with them. Envelopes with another wire version
//! are refused.
//!
//! [`BincodeCodec`] is the wire format. [`JsonCodec`] is handy for
//! debugging and for feeding hand-written seals to a node.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::seal::{Seal, BALLOT_HINT, PROPOSAL_HINT};
use crate::config::WIRE_VERSION;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported wire version {got} (expected {expected})")]
    UnsupportedVersion { got: u8, expected: u8 },

    #[error("cannot encode {hint} seal: {reason}")]
    Encode { hint: String, reason: String },

    #[error("cannot decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u8,
    hint: String,
    body: Vec<u8>,
}

/// Seal (de)serialization.
pub trait SealCodec: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn encode(&self, seal: &Seal) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Seal, CodecError>;
}

/// A serde data format the envelope scheme can run on.
trait Format {
    fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, String>;
    fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String>;
}

fn encode_with<F: Format>(seal: &Seal) -> Result<Vec<u8>, CodecError> {
    let encode_err = |reason: String| CodecError::Encode {
        hint: seal.hint().to_string(),
        reason,
    };
    let body = match seal {
        Seal::Ballot(b) => F::to_bytes(b).map_err(encode_err)?,
        Seal::Proposal(p) => F::to_bytes(p).map_err(encode_err)?,
        Seal::Unknown { body, .. } => body.clone(),
    };
    let envelope = Envelope {
        version: WIRE_VERSION,
        hint: seal.hint().to_string(),
        body,
    };
    F::to_bytes(&envelope).map_err(encode_err)
}

fn decode_with<F: Format>(bytes: &[u8]) -> Result<Seal, CodecError> {
    let envelope: Envelope = F::from_bytes(bytes).map_err(|reason| CodecError::Decode {
        what: "envelope",
        reason,
    })?;
    if envelope.version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion {
            got: envelope.version,
            expected: WIRE_VERSION,
        });
    }
    match envelope.hint.as_str() {
        BALLOT_HINT => F::from_bytes(&envelope.body)
            .map(Seal::Ballot)
            .map_err(|reason| CodecError::Decode {
                what: "ballot",
                reason,
            }),
        PROPOSAL_HINT => F::from_bytes(&envelope.body)
            .map(Seal::Proposal)
            .map_err(|reason| CodecError::Decode {
                what: "proposal",
                reason,
            }),
        _ => Ok(Seal::Unknown {
            hint: envelope.hint,
            body: envelope.body,
        }),
    }
}

// ---------------------------------------------------------------------------
// Bincode
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

struct Bincode;

impl Format for Bincode {
    fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
        bincode::serialize(value).map_err(|e| e.to_string())
    }

    fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
        bincode::deserialize(bytes).map_err(|e| e.to_string())
    }
}

impl SealCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode(&self, seal: &Seal) -> Result<Vec<u8>, CodecError> {
        encode_with::<Bincode>(seal)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Seal, CodecError> {
        decode_with::<Bincode>(bytes)
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

struct Json;

impl Format for Json {
    fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
        serde_json::to_vec(value).map_err(|e| e.to_string())
    }

    fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }
}

impl SealCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, seal: &Seal) -> Result<Vec<u8>, CodecError> {
        encode_with::<Json>(seal)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Seal, CodecError> {
        decode_with::<Json>(bytes)
    }
}
