//! # Storage Module
//!
//! Blocks and the stores that hold them. The consensus core writes to
//! storage exactly once per height, at the moment a round concludes with an
//! ACCEPT majority, and reads from it while booting and syncing.
//!
//! ```text
//! block.rs  - Block structure, genesis, hash/verify, operations root
//! store.rs  - BlockStore contract, MemoryBlockStore, StorageError
//! db.rs     - SledBlockStore (sled + bincode)
//! ```
//!
//! Bincode for on-disk serialization; JSON stays on the debugging and API
//! side.

pub mod block;
pub mod db;
pub mod store;

pub use block::{compute_operations_root, Block, BlockError, BlockHeader};
pub use db::SledBlockStore;
pub use store::{BlockStore, MemoryBlockStore, StorageError, StorageResult};
