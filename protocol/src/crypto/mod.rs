//! # Cryptographic Primitives
//!
//! Thin wrappers over audited implementations:
//!
//! - **Ed25519** (`ed25519-dalek`) for ballot and proposal signatures.
//! - **BLAKE3** for content hashes of ballots, proposals and blocks.
//!
//! The consensus core only needs "signed and verifiable" from this module.
//! Nothing above it depends on the concrete curve or digest.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, Hash, HashError};
pub use keys::{Address, KeyError, Keypair, PublicKey, Signature};
