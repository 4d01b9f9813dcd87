//! Error taxonomy for the sync engine.
//!
//! Errors within a single (peer, stream) task never crash the engine or
//! other peers; they drop at most the containing peer. See
//! [`SyncError::drops_peer`] for the policy.

use std::time::Duration;

use thiserror::Error;

use shoal_core::bitvector::BitVectorError;
use shoal_core::wire::WireError;
use shoal_core::Stream;
use shoal_store::StoreError;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    // protocol violations from the remote
    #[error("offer for unsubscribed stream {stream}")]
    UnexpectedOffer { stream: Stream },

    #[error("no server for stream {stream}")]
    UnexpectedWant { stream: Stream },

    #[error("empty offered batch for stream {stream}")]
    EmptyBatch { stream: Stream },

    #[error("offered batch of {count} hashes exceeds limit {limit}")]
    OversizedBatch { count: usize, limit: usize },

    #[error("want bitvector does not cover batch of {expected} hashes")]
    WantLengthMismatch { expected: usize },

    #[error(transparent)]
    Wire(#[from] WireError),

    // local conditions
    #[error("stream {stream} already registered")]
    DuplicateStream { stream: Stream },

    #[error("unknown stream kind {name:?}")]
    UnknownStreamKind { name: String },

    #[error("unknown peer")]
    UnknownPeer,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("batch not delivered within {0:?}")]
    BatchTimeout(Duration),

    #[error(transparent)]
    Store(StoreError),

    #[error("fetch of offered chunk failed: {0}")]
    DataFetch(StoreError),

    #[error("subscription rejected by peer: {0}")]
    SubscribeRejected(String),

    #[error("transport closed")]
    TransportClosed,
}

impl SyncError {
    /// Whether this error tears down the whole peer connection, per the
    /// propagation policy: protocol violations, timeouts, and store
    /// failures drop the peer; cancellations, rejected subscriptions, and
    /// invalid local arguments leave it up.
    pub fn drops_peer(&self) -> bool {
        !matches!(
            self,
            SyncError::Cancelled
                | SyncError::SubscribeRejected(_)
                | SyncError::InvalidArgument(_)
                | SyncError::DuplicateStream { .. }
                | SyncError::UnknownStreamKind { .. }
                | SyncError::UnknownPeer
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Cancelled => SyncError::Cancelled,
            other => SyncError::Store(other),
        }
    }
}

impl From<BitVectorError> for SyncError {
    fn from(e: BitVectorError) -> Self {
        SyncError::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_never_drops_the_peer() {
        assert!(!SyncError::Cancelled.drops_peer());
        assert!(!SyncError::SubscribeRejected("invalid bin".into()).drops_peer());
    }

    #[test]
    fn violations_and_timeouts_drop_the_peer() {
        assert!(SyncError::UnexpectedWant {
            stream: Stream::new("SYNC", "0", true)
        }
        .drops_peer());
        assert!(SyncError::BatchTimeout(Duration::from_secs(120)).drops_peer());
        assert!(SyncError::Store(StoreError::NotFound).drops_peer());
        assert!(SyncError::TransportClosed.drops_peer());
    }

    #[test]
    fn store_cancellation_maps_to_cancelled() {
        let e: SyncError = StoreError::Cancelled.into();
        assert!(matches!(e, SyncError::Cancelled));
        let e: SyncError = StoreError::NotFound.into();
        assert!(matches!(e, SyncError::Store(StoreError::NotFound)));
    }
}
