//! Priority outbox — per-peer multi-queue writer toward the transport.
//!
//! Each peer has a small number of priority bands, each a bounded queue.
//! The writer task drains bands in strict priority order; a full band
//! blocks the sender until space frees up or the peer goes away, which is
//! the sole backpressure mechanism toward peers slower than the local
//! store iterator.
//!
//! Ordering: frames submitted on the same band from the same task are
//! delivered in submission order. Nothing is guaranteed across bands.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::select_all;
use tokio::sync::mpsc;

use shoal_core::wire::Message;

use crate::error::SyncError;
use crate::transport::Transport;

pub(crate) struct Frame {
    pub code: u8,
    pub payload: Bytes,
}

/// Send half of a peer's outbox. Owned by the peer; dropping it lets the
/// writer drain and exit.
pub struct Outbox {
    bands: Vec<mpsc::Sender<Frame>>,
}

/// Writer half. `run` consumes it on the peer's writer task.
pub struct OutboxDriver {
    bands: Vec<mpsc::Receiver<Frame>>,
}

/// Why the writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The outbox was dropped and all queued frames were flushed.
    Drained,
    /// The transport refused a frame; the connection is gone.
    TransportClosed,
}

impl Outbox {
    pub fn new(priority_bands: u8, per_band_queue: usize) -> (Outbox, OutboxDriver) {
        let bands = priority_bands.max(1) as usize;
        let depth = per_band_queue.max(1);
        let mut txs = Vec::with_capacity(bands);
        let mut rxs = Vec::with_capacity(bands);
        for _ in 0..bands {
            let (tx, rx) = mpsc::channel(depth);
            txs.push(tx);
            rxs.push(rx);
        }
        (Outbox { bands: txs }, OutboxDriver { bands: rxs })
    }

    /// Enqueue a message on the given band, blocking under backpressure.
    /// Priorities beyond the configured band count collapse into the
    /// highest band.
    pub async fn send(&self, msg: &Message, priority: u8) -> Result<(), SyncError> {
        let band = (priority as usize).min(self.bands.len() - 1);
        let frame = Frame {
            code: msg.code(),
            payload: msg.encode(),
        };
        self.bands[band]
            .send(frame)
            .await
            .map_err(|_| SyncError::TransportClosed)
    }
}

impl OutboxDriver {
    /// Drain bands into the transport until the outbox is dropped or the
    /// transport closes.
    pub async fn run(mut self, transport: Arc<dyn Transport>) -> WriterExit {
        loop {
            let frame = match self.next_ready() {
                Some(f) => f,
                None => {
                    // All bands idle: wait for any of them.
                    let recvs = self.bands.iter_mut().map(|rx| Box::pin(rx.recv()));
                    let (received, _, _) = select_all(recvs).await;
                    match received {
                        Some(f) => f,
                        // Outbox dropped: flush whatever is still queued.
                        None => return self.flush(&transport).await,
                    }
                }
            };
            if transport.send(frame.code, frame.payload).await.is_err() {
                tracing::debug!("transport closed, outbox writer exiting");
                return WriterExit::TransportClosed;
            }
        }
    }

    /// Pop the highest-priority queued frame without waiting.
    fn next_ready(&mut self) -> Option<Frame> {
        for rx in self.bands.iter_mut().rev() {
            if let Ok(frame) = rx.try_recv() {
                return Some(frame);
            }
        }
        None
    }

    async fn flush(&mut self, transport: &Arc<dyn Transport>) -> WriterExit {
        while let Some(frame) = self.next_ready() {
            if transport.send(frame.code, frame.payload).await.is_err() {
                return WriterExit::TransportClosed;
            }
        }
        WriterExit::Drained
    }
}
