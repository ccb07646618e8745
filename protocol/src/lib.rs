// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ISAAC Protocol: Consensus Core
//!
//! A Byzantine-fault-tolerant voting core in the ISAAC family. A fixed set
//! of validators agrees, height by height, on the next block through three
//! voting stages per round:
//!
//! ```text
//!   INIT   - "I am at height H and my last block is B(H-1)"
//!   SIGN   - "the proposal for (H, round) is valid and yields block X"
//!   ACCEPT - "I am ready to commit X"
//! ```
//!
//! A stage concludes when a threshold percentage of the round's acting
//! suffrage votes for the same hash (majority) or when no hash can reach it
//! any more (draw). A draw or a round timeout moves everyone to the next
//! round at the same height.
//!
//! ## Architecture
//!
//! - **consensus**: threshold, suffrage, ballotbox, vote compiler, state
//!   handlers, controller and the async runtime.
//! - **network**: seal type, codecs, broadcast transport, block sync.
//! - **storage**: blocks and block stores (memory, sled).
//! - **crypto**: Ed25519 keys and BLAKE3 hashes.
//! - **config**: protocol constants and defaults.
//!
//! ## Design Rules
//!
//! 1. One handler is live at a time. The controller performs every swap.
//! 2. No ambient state. Everything a validator uses is in its context.
//! 3. Validation failures are logged and counted, never fatal.
//! 4. Configuration errors are fatal, and only at startup.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod network;
pub mod storage;
