//! The seam to the message transport below the engine.
//!
//! The engine assumes an ordered, reliable, framed message stream per
//! peer: frames submitted here arrive at the remote in submission order or
//! the connection is considered gone. Encryption, multiplexing, and
//! liveness are the implementor's concern. Inbound frames are fed to
//! [`crate::Registry::handle_message`] by the transport's read loop.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// The connection to the peer is gone. All endpoints for the peer are
/// torn down when this surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transport closed")]
pub struct TransportClosed;

/// One peer's outbound frame sink.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one framed protocol message: a message code and its payload.
    /// Must preserve submission order.
    async fn send(&self, code: u8, payload: Bytes) -> Result<(), TransportClosed>;
}
