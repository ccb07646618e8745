//! # Network Module
//!
//! Everything between the consensus core and the wire: the seal type,
//! codecs, the broadcast transport and block sync sources.
//!
//! ```text
//! seal.rs       - Seal = Ballot | Proposal | Unknown
//! codec.rs      - Envelope codecs (bincode wire, JSON debug)
//! transport.rs  - Transport trait, in-process LocalNetwork, recorder
//! sync.rs       - BlockSource trait and peer-store source
//! ```
//!
//! The protocol crate stays transport-agnostic. The node binary decides
//! which transport and block source to wire in.

pub mod codec;
pub mod seal;
pub mod sync;
pub mod transport;

pub use codec::{BincodeCodec, CodecError, JsonCodec, SealCodec};
pub use seal::Seal;
pub use sync::{fetch_verified, BlockSource, PeerBlockSource, SyncError};
pub use transport::{LocalEndpoint, LocalNetwork, RecordingTransport, Transport, TransportError};
