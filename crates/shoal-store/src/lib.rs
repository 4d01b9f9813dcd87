//! shoal-store — the narrow chunk-store contract the sync engine consumes.
//!
//! The engine never sees persistence internals; it sees proximity-bin
//! iteration over a monotonically increasing index, lookup with
//! request-in-flight semantics, and idempotent registration of pending
//! requests that resolve when data arrives. [`mem::MemChunkStore`] is the
//! reference implementation backing the engine's tests and embedders that
//! do not need persistence.

pub mod bin;
pub mod mem;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;

use shoal_core::Address;

pub use mem::MemChunkStore;

/// Compute the content address of a chunk payload.
pub fn chunk_address(data: &[u8]) -> Address {
    *blake3::hash(data).as_bytes()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("chunk not found")]
    NotFound,

    #[error("chunk data does not hash to its address")]
    AddressMismatch,

    #[error("pending request cancelled")]
    Cancelled,

    #[error("store backend: {0}")]
    Backend(String),
}

// ── Pending requests ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingState {
    Waiting,
    Stored,
    Cancelled,
}

/// Resolution side of a pending chunk request. Owned by the store; every
/// [`ChunkWaiter`] minted from it observes the same outcome.
#[derive(Debug)]
pub struct ChunkResolver {
    tx: watch::Sender<PendingState>,
}

impl ChunkResolver {
    /// Mint another wait-handle for this request.
    pub fn waiter(&self) -> ChunkWaiter {
        ChunkWaiter {
            rx: self.tx.subscribe(),
        }
    }

    /// Resolve all waiters: the chunk landed.
    pub fn stored(&self) {
        let _ = self.tx.send(PendingState::Stored);
    }

    /// Resolve all waiters with [`StoreError::Cancelled`].
    pub fn cancelled(&self) {
        let _ = self.tx.send(PendingState::Cancelled);
    }
}

/// Wait-handle for an in-flight chunk request.
///
/// The pending request itself is owned by the store; holders of a waiter
/// only observe its resolution. Dropping a waiter releases nothing.
#[derive(Debug)]
pub struct ChunkWaiter {
    rx: watch::Receiver<PendingState>,
}

impl ChunkWaiter {
    /// Create a resolver/waiter pair for a fresh pending request.
    pub fn pair() -> (ChunkResolver, ChunkWaiter) {
        let (tx, rx) = watch::channel(PendingState::Waiting);
        (ChunkResolver { tx }, ChunkWaiter { rx })
    }

    /// A waiter that is already resolved. Used when the caller must not
    /// block on store confirmation.
    pub fn resolved() -> Self {
        let (tx, rx) = watch::channel(PendingState::Stored);
        drop(tx);
        Self { rx }
    }

    /// Resolve when the chunk lands in the store.
    pub async fn wait(mut self) -> Result<(), StoreError> {
        loop {
            match *self.rx.borrow_and_update() {
                PendingState::Stored => return Ok(()),
                PendingState::Cancelled => return Err(StoreError::Cancelled),
                PendingState::Waiting => {}
            }
            if self.rx.changed().await.is_err() {
                // Store dropped the request without resolving it.
                return Err(StoreError::Cancelled);
            }
        }
    }
}

/// Result of a chunk lookup.
#[derive(Debug)]
pub enum Fetched {
    /// The chunk is local.
    Present(Bytes),
    /// Another caller already requested this chunk; the waiter resolves
    /// when data lands.
    Pending(ChunkWaiter),
    /// Not local and no request in flight.
    NotFound,
}

// ── The store contract ────────────────────────────────────────────────────────

/// Minimal contract the sync engine consumes. Implementations must be
/// internally thread-safe; every method may be called concurrently from
/// any peer's tasks.
pub trait ChunkStore: Send + Sync {
    /// Look up a chunk, reporting an in-flight request if one exists.
    fn get(&self, addr: &Address) -> Result<Fetched, StoreError>;

    /// Idempotently register a pending request for `addr`.
    ///
    /// Returns `(None, false)` when the chunk is already local, otherwise
    /// a waiter and whether this call created the request (`false` means
    /// another caller already registered it).
    fn get_or_create_request(
        &self,
        addr: &Address,
    ) -> Result<(Option<ChunkWaiter>, bool), StoreError>;

    /// Store a chunk, verifying it hashes to `addr`, and resolve any
    /// pending request for it.
    fn put(&self, addr: Address, data: Bytes) -> Result<(), StoreError>;

    /// Iterate addresses stored under proximity bin `bin` with local index
    /// in `[from, to)`, in index order. Stops early when `f` returns
    /// false. Must be safe to call concurrently with inserts: items with
    /// index below the snapshot taken at call start are never missed.
    fn iterate(
        &self,
        bin: u8,
        from: u64,
        to: u64,
        f: &mut dyn FnMut(Address, u64) -> bool,
    ) -> Result<(), StoreError>;

    /// The next index that would be assigned to a new chunk in this bin.
    fn current_index(&self, bin: u8) -> u64;
}
