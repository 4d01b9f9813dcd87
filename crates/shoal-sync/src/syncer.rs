//! The "SYNC" stream kind — per-proximity-bin chunk syncing backed by the
//! local store.
//!
//! The server walks the bin's append-only index and offers hashes in
//! batches; the client registers pending requests for the ones it lacks.
//! Stream keys are base-36 bin numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::watch;

use shoal_core::{Address, Stream, SyncConfig, HASH_SIZE};
use shoal_store::bin::parse_bin_key;
use shoal_store::{ChunkStore, ChunkWaiter, Fetched, StoreError};

use crate::error::SyncError;
use crate::registry::{Client, OfferedBatch, ProofBuilder, Registry, Server};
use shoal_core::wire::{Takeover, TakeoverProof};

/// Name under which the sync kind is registered.
pub const SYNC_STREAM_NAME: &str = "SYNC";

/// Register the SYNC server and client factories on a registry.
pub fn register_sync(registry: &Arc<Registry>, store: Arc<dyn ChunkStore>, config: &SyncConfig) {
    let batch_size = config.batch_size;
    let poll = config.iter_poll();
    let server_store = store.clone();
    registry.register_server_func(
        SYNC_STREAM_NAME,
        Box::new(move |_peer, key, live| {
            let bin = parse_bin_key(key)
                .map_err(|e| SyncError::InvalidArgument(e.to_string()))?;
            Ok(Box::new(BinSyncServer::new(
                live,
                bin,
                server_store.clone(),
                batch_size,
                poll,
            )) as Box<dyn Server>)
        }),
    );

    let skip_check = config.skip_check;
    let ignore_existing_request = config.ignore_existing_request;
    registry.register_client_func(
        SYNC_STREAM_NAME,
        Box::new(move |_peer, key, live| {
            Ok(Box::new(BinSyncClient::new(
                store.clone(),
                Stream::new(SYNC_STREAM_NAME, key, live),
                skip_check,
                ignore_existing_request,
            )) as Box<dyn Client>)
        }),
    );
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Upstream endpoint of a SYNC stream: offers the hashes stored under one
/// proximity bin, live from the subscription point or historically from
/// index zero.
pub struct BinSyncServer {
    bin: u8,
    store: Arc<dyn ChunkStore>,
    /// Bin index at subscription time. Live offers start here; historical
    /// windows are interpreted against it.
    session_at: u64,
    start: u64,
    batch_size: usize,
    poll: Duration,
    quit: watch::Sender<bool>,
}

impl BinSyncServer {
    pub fn new(
        live: bool,
        bin: u8,
        store: Arc<dyn ChunkStore>,
        batch_size: usize,
        poll: Duration,
    ) -> Self {
        let session_at = store.current_index(bin);
        let start = if live { session_at } else { 0 };
        Self {
            bin,
            store,
            session_at,
            start,
            batch_size,
            poll,
            quit: watch::channel(false).0,
        }
    }
}

#[async_trait]
impl Server for BinSyncServer {
    async fn set_next_batch(
        &self,
        mut from: u64,
        mut to: u64,
    ) -> Result<Option<OfferedBatch>, SyncError> {
        if from == 0 {
            from = self.start;
        }
        if to <= from || from >= self.session_at {
            // open-ended window
            to = u64::MAX;
        }
        let mut quit = self.quit.subscribe();
        loop {
            let mut batch = BytesMut::new();
            let mut count = 0usize;
            let mut last = from;
            self.store.iterate(self.bin, from, to, &mut |addr, idx| {
                batch.put_slice(&addr);
                count += 1;
                last = idx;
                count < self.batch_size
            })?;
            if count > 0 {
                tracing::trace!(
                    bin = self.bin,
                    len = count,
                    from,
                    to = last + 1,
                    index = self.store.current_index(self.bin),
                    "sync batch ready"
                );
                return Ok(Some(OfferedBatch {
                    hashes: batch.freeze(),
                    from,
                    to: last + 1,
                    proof: None,
                }));
            }
            // nothing new under this bin yet: poll the iterator again later
            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = quit.wait_for(|q| *q) => return Ok(None),
            }
        }
    }

    async fn get_data(&self, addr: &Address) -> Result<Bytes, SyncError> {
        match self.store.get(addr).map_err(SyncError::DataFetch)? {
            Fetched::Present(data) => Ok(data),
            Fetched::Pending(waiter) => {
                waiter.wait().await?;
                match self.store.get(addr).map_err(SyncError::DataFetch)? {
                    Fetched::Present(data) => Ok(data),
                    _ => Err(SyncError::DataFetch(StoreError::NotFound)),
                }
            }
            Fetched::NotFound => Err(SyncError::DataFetch(StoreError::NotFound)),
        }
    }

    fn close(&self) {
        let _ = self.quit.send(true);
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Downstream endpoint of a SYNC stream.
pub struct BinSyncClient {
    store: Arc<dyn ChunkStore>,
    stream: Stream,
    skip_check: bool,
    /// Kept as configuration; the behaviour remains "reuse the pending
    /// request" even when a request is already in flight.
    #[allow(dead_code)]
    ignore_existing_request: bool,
    /// Whether batch completion yields takeover proofs.
    provable: bool,
    start: u64,
    end: AtomicU64,
}

impl BinSyncClient {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        stream: Stream,
        skip_check: bool,
        ignore_existing_request: bool,
    ) -> Self {
        Self {
            store,
            stream,
            skip_check,
            ignore_existing_request,
            provable: false,
            start: 0,
            end: AtomicU64::new(0),
        }
    }

    /// A proving variant: `batch_done` yields takeover proofs with a
    /// running index and an empty signature.
    pub fn proving(store: Arc<dyn ChunkStore>, stream: Stream) -> Self {
        Self {
            provable: true,
            ..Self::new(store, stream, false, false)
        }
    }

    fn take_over(&self, stream: Stream, hashes: &[u8], root: Address) -> Takeover {
        let n = (hashes.len() / HASH_SIZE) as u64;
        let end = self.end.fetch_add(n, Ordering::Relaxed) + n;
        Takeover {
            stream,
            start: self.start,
            end,
            root,
        }
    }
}

impl Client for BinSyncClient {
    fn need_data(&self, addr: &Address) -> Result<Option<ChunkWaiter>, SyncError> {
        let (waiter, created) = self.store.get_or_create_request(addr)?;
        match waiter {
            None => Ok(None),
            Some(w) => {
                tracing::trace!(
                    stream = %self.stream,
                    addr = %hex::encode(&addr[..4]),
                    created,
                    "waiting on chunk request"
                );
                if self.skip_check {
                    // accept the delivery without store confirmation
                    drop(w);
                    return Ok(Some(ChunkWaiter::resolved()));
                }
                Ok(Some(w))
            }
        }
    }

    fn batch_done(
        &self,
        stream: &Stream,
        _from: u64,
        hashes: &[u8],
        root: &Address,
    ) -> Option<ProofBuilder> {
        if !self.provable {
            return None;
        }
        let takeover = self.take_over(stream.clone(), hashes, *root);
        Some(Box::new(move || {
            Ok(TakeoverProof {
                sig: Bytes::new(),
                takeover,
            })
        }))
    }

    fn close(&self) {}
}
