//! # Consensus Module
//!
//! The ISAAC voting core: who votes, how votes are counted, and the state
//! machine that turns verdicts into committed blocks.
//!
//! ```text
//! threshold.rs   - minimum vote count from (total, percent)
//! suffrage.rs    - validator set, acting suffrage selectors
//! ballot.rs      - stages, ballot bodies, signed ballots
//! ballotbox.rs   - per-bucket vote ledger and verdicts
//! proposal.rs    - proposals, operation pool, proposal validation
//! maker.rs       - ballot makers (honest and fault-injecting)
//! compiler.rs    - seal validation into the ballotbox
//! home.rs        - the node's own position
//! policy.rs      - runtime-tunable parameters
//! timer.rs       - clock abstraction and epoch-tagged timers
//! metrics.rs     - Prometheus instrumentation
//! context.rs     - shared collaborators, built once per validator
//! state/         - Booting, JoinNetwork, Consensus, Syncing, Stopped
//! controller.rs  - the single owner of the active handler
//! runtime.rs     - async driver (inbound queue + timers + shutdown)
//! ```
//!
//! Data flows one way: seal → compiler → ballotbox → verdict → handler →
//! ballots out / block committed. Only the active handler writes the home
//! state.

pub mod ballot;
pub mod ballotbox;
pub mod compiler;
pub mod context;
pub mod controller;
pub mod home;
pub mod maker;
pub mod metrics;
pub mod policy;
pub mod proposal;
pub mod runtime;
pub mod state;
pub mod suffrage;
pub mod threshold;
pub mod timer;

pub use ballot::{Ballot, BallotBody, BallotError, BucketKey, Height, Round, Stage};
pub use ballotbox::{Ballotbox, TallyRule, Verdict, VoteResult};
pub use compiler::{CompileError, Compiled, VoteCompiler};
pub use context::{ContextBuilder, ContextError, HandlerContext};
pub use controller::{ControllerError, StateController};
pub use home::{HomeState, HomeStateCell, NodeState};
pub use maker::{
    BallotInputs, BallotMaker, Fault, FaultMatch, FaultRule, FaultyBallotMaker, SignedBallotMaker,
};
pub use metrics::ConsensusMetrics;
pub use policy::{Policy, PolicyError};
pub use proposal::{
    DefaultProposalValidator, OperationPool, Proposal, ProposalError, ProposalMaker, ProposalPool,
    ProposalValidator,
};
pub use runtime::{ConsensusRuntime, RuntimeError};
pub use state::{HandlerError, HandlerState, Transition};
pub use suffrage::{
    ActingSuffrage, FixedProposerSuffrage, FullMembershipSuffrage, RoundRobinSuffrage,
    SharedValidators, Suffrage, SuffrageError, SuffrageKind, ValidatorSet,
};
pub use threshold::{compute as compute_threshold, Threshold, ThresholdError};
pub use timer::{Clock, DueTimer, ManualClock, SystemClock, TimerFired, TimerKind, Timers};
