//! shoal-sync — the stream-synchronization engine of the shoal overlay.
//!
//! Keeps replicas of newly stored chunks propagating toward the peers
//! closest to each chunk's address, and lets peers backfill historical
//! chunks they should hold. Per peer and stream, a server offers batches
//! of hashes, the client answers with the subset it wants, and the server
//! delivers those chunks, pipelined one outstanding batch at a time.

pub mod error;
pub mod outbox;
pub mod peer;
pub mod registry;
pub mod syncer;
pub mod transport;

pub use error::SyncError;
pub use outbox::{Outbox, OutboxDriver, WriterExit};
pub use peer::Peer;
pub use registry::{
    Client, ClientFunc, OfferedBatch, PeerId, ProofBuilder, Registry, Server, ServerFunc,
    SubscribeError,
};
pub use syncer::{BinSyncClient, BinSyncServer, SYNC_STREAM_NAME};
pub use transport::{Transport, TransportClosed};
