//! # Protocol Configuration & Constants
//!
//! Every fixed number the consensus core relies on lives here. Tunable
//! values (timeouts, threshold percent) have their defaults here and are
//! overridden at runtime through [`crate::consensus::Policy`].

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Protocol version string reported by the node binary.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Wire version embedded in every encoded seal. Decoders reject other
/// versions instead of guessing at a layout.
pub const WIRE_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Hash Domain Tags
// ---------------------------------------------------------------------------

/// Domain tag for ballot signing payloads.
pub const BALLOT_DOMAIN: &[u8] = b"isaac/ballot/v1";

/// Domain tag for proposal content hashes.
pub const PROPOSAL_DOMAIN: &[u8] = b"isaac/proposal/v1";

/// Domain tag for block header hashes.
pub const BLOCK_DOMAIN: &[u8] = b"isaac/block/v1";

/// Domain tag for the operations root of a block.
pub const OPERATIONS_DOMAIN: &[u8] = b"isaac/operations/v1";

/// Domain tag mixed into the full-membership proposer rotation.
pub const SUFFRAGE_DOMAIN: &[u8] = b"isaac/suffrage/v1";

/// Payload hashed into the genesis block's proposal field.
pub const GENESIS_MESSAGE: &[u8] = b"isaac genesis";

// ---------------------------------------------------------------------------
// Threshold
// ---------------------------------------------------------------------------

/// Default majority percentage. With 4 validators this yields a minimum of
/// 3 votes, the classic `2f + 1` for `f = 1`.
pub const DEFAULT_THRESHOLD_PERCENT: u8 = 67;

/// Acting suffrage size meaning "the whole validator set".
pub const ACTING_ALL: usize = 0;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// How long a round waits for the designated proposer's proposal after INIT
/// majority before moving to the next round.
pub const DEFAULT_TIMEOUT_WAITING_PROPOSAL: Duration = Duration::from_secs(5);

/// Round timeout: no majority and no draw within this window moves the node
/// to the next round.
pub const DEFAULT_TIMEOUT_WAITING_BALLOT: Duration = Duration::from_secs(10);

/// Re-broadcast interval for INIT ballots (JoinNetwork and Consensus).
pub const DEFAULT_INTERVAL_BROADCASTING_INIT: Duration = Duration::from_secs(1);

/// Re-broadcast interval for ACCEPT ballots.
pub const DEFAULT_INTERVAL_BROADCASTING_ACCEPT: Duration = Duration::from_secs(1);

/// Delay between block sync attempts after a failed fetch.
pub const DEFAULT_INTERVAL_SYNC_RETRY: Duration = Duration::from_secs(1);

/// Delay before retrying a failed block commit.
pub const DEFAULT_INTERVAL_COMMIT_RETRY: Duration = Duration::from_millis(500);

/// Consecutive commit failures tolerated before escalating to Syncing.
pub const DEFAULT_MAX_COMMIT_FAILURES: u32 = 3;

/// Heights above the working height a seal may target before the compiler
/// drops it. Bounds ballotbox and proposal pool growth.
pub const DEFAULT_MAX_HEIGHT_AHEAD: u64 = 64;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Upper bound on chained handler transitions processed for one event.
/// A handler chain longer than this is a bug, not a protocol situation.
pub const MAX_CHAINED_TRANSITIONS: usize = 8;

/// Operations pulled from the pool into one proposal.
pub const MAX_OPERATIONS_PER_PROPOSAL: usize = 256;

/// Capacity of the inbound seal queue between transport and runtime.
pub const INBOUND_QUEUE_CAPACITY: usize = 4096;
