//! shoal-core — stream identifiers, wire format, and protocol primitives.
//! All other shoal crates depend on this one.

pub mod bitvector;
pub mod config;
pub mod metrics;
pub mod stream;
pub mod wire;

pub use bitvector::BitVector;
pub use config::SyncConfig;
pub use stream::{Range, Stream};
pub use wire::{Address, HASH_SIZE};
