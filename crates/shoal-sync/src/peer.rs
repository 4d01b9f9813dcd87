//! Per-peer stream engine.
//!
//! Each connected peer carries two tables behind one lock: `servers` for
//! streams we feed to the peer, `clients` for streams the peer feeds us.
//! Batches are serialized per endpoint by a one-slot `next` channel — the
//! server's slot frees when its offer is answered, the client's when the
//! previous batch's wanted chunks are all stored — and every long wait is
//! cancellable through the endpoint's quit channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures_util::future::try_join_all;
use tokio::sync::{mpsc, watch};

use shoal_core::metrics;
use shoal_core::wire::{
    ChunkDeliveryMsg, Message, OfferedHashesMsg, SubscribeErrorMsg, SubscribeMsg, TakeoverProof,
    TakeoverProofMsg, WantedHashesMsg,
};
use shoal_core::{BitVector, Stream, SyncConfig, HASH_SIZE};

use shoal_core::stream::{history_priority, PRIORITY_HIGH};

use crate::error::SyncError;
use crate::outbox::Outbox;
use crate::registry::{Client, PeerId, Registry, Server};

/// Log token for a peer id.
pub(crate) fn short_id(id: &PeerId) -> String {
    hex::encode(&id[..4])
}

/// Parameters recorded by `Subscribe` until the first offer materializes
/// the client endpoint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientParams {
    pub priority: u8,
    /// Upper bound of the requested history, 0 if unbounded.
    pub to: u64,
}

struct Tables {
    servers: HashMap<Stream, Arc<ServerState>>,
    clients: HashMap<Stream, Arc<ClientState>>,
    client_params: HashMap<Stream, ClientParams>,
}

/// Engine-side state of one server endpoint.
pub(crate) struct ServerState {
    stream: Stream,
    priority: u8,
    server: Arc<dyn Server>,
    /// Hashes of the outstanding offer, served verbatim when the matching
    /// `WantedHashes` arrives.
    current_batch: Mutex<Bytes>,
    /// One-slot ready semaphore: a token is present exactly when no offer
    /// is outstanding.
    next_tx: mpsc::Sender<()>,
    next: tokio::sync::Mutex<mpsc::Receiver<()>>,
    quit: watch::Sender<bool>,
    /// Strongest takeover attestation received for this stream.
    takeover: Mutex<Option<TakeoverProof>>,
}

impl ServerState {
    fn close(&self) {
        let _ = self.quit.send(true);
        self.server.close();
    }
}

/// Engine-side state of one client endpoint.
pub(crate) struct ClientState {
    stream: Stream,
    priority: u8,
    client: Arc<dyn Client>,
    /// Session boundary as last reported by the upstream; updated to the
    /// offer's `from` on every live offer.
    session_at: AtomicU64,
    /// Upper bound of the requested history, 0 if unbounded.
    to: u64,
    /// One-slot completion channel: carries the previous batch's outcome.
    /// Pre-seeded so the first `WantedHashes` goes out immediately.
    next_tx: mpsc::Sender<Result<(), SyncError>>,
    next: tokio::sync::Mutex<mpsc::Receiver<Result<(), SyncError>>>,
    quit: watch::Sender<bool>,
}

impl ClientState {
    fn close(&self) {
        let _ = self.quit.send(true);
        self.client.close();
    }

    /// The next request window after a batch ending at `from` (half-open
    /// coordinates: the follow-up starts exactly where the offer ended).
    /// `(0, 0)` means the stream is exhausted and the reply is suppressed;
    /// an empty window `from == to` is the open-ended tail-request form.
    fn next_batch(&self, from: u64) -> (u64, u64) {
        let session_at = self.session_at.load(Ordering::Relaxed);
        if self.to > 0 && from >= self.to {
            return (0, 0);
        }
        if self.stream.live {
            return (from, from);
        }
        if self.to > 0 {
            return (from, self.to);
        }
        if from < session_at {
            // catch up to the session boundary first
            return (from, session_at);
        }
        (from, from)
    }
}

/// One connected peer's stream engine. Created by
/// [`Registry::run_peer`]; owned by the registry's peer table. Endpoint
/// tasks hold the peer id and a weak registry handle, never an owning
/// reference back, so dropping a peer needs no cooperation from running
/// tasks.
pub struct Peer {
    id: PeerId,
    registry: Weak<Registry>,
    outbox: Outbox,
    config: SyncConfig,
    tables: Mutex<Tables>,
    quit: watch::Sender<bool>,
}

impl Peer {
    pub(crate) fn new(
        id: PeerId,
        registry: Weak<Registry>,
        outbox: Outbox,
        config: SyncConfig,
    ) -> Arc<Peer> {
        Arc::new(Peer {
            id,
            registry,
            outbox,
            config,
            tables: Mutex::new(Tables {
                servers: HashMap::new(),
                clients: HashMap::new(),
                client_params: HashMap::new(),
            }),
            quit: watch::channel(false).0,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Streams this peer is being served on.
    pub fn server_streams(&self) -> Vec<Stream> {
        self.tables().servers.keys().cloned().collect()
    }

    /// Streams this peer feeds us on (materialized clients only).
    pub fn client_streams(&self) -> Vec<Stream> {
        self.tables().clients.keys().cloned().collect()
    }

    /// Strongest takeover attestation received for a stream we serve.
    pub fn takeover_proof(&self, stream: &Stream) -> Option<TakeoverProof> {
        self.tables()
            .servers
            .get(stream)
            .and_then(|s| s.takeover.lock().expect("takeover slot poisoned").clone())
    }

    pub(crate) async fn send_message(&self, msg: &Message, priority: u8) -> Result<(), SyncError> {
        self.outbox.send(msg, priority).await
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("peer tables poisoned")
    }

    fn registry(&self) -> Result<Arc<Registry>, SyncError> {
        self.registry.upgrade().ok_or(SyncError::Cancelled)
    }

    /// Tear down the containing peer; forwards to the registry.
    fn drop_with(&self, err: SyncError) {
        if let Some(registry) = self.registry.upgrade() {
            registry.drop_peer(&self.id, err);
        }
    }

    // ── Table maintenance ────────────────────────────────────────────────────

    pub(crate) fn set_client_params(
        &self,
        stream: Stream,
        params: ClientParams,
    ) -> Result<(), SyncError> {
        let mut tables = self.tables();
        if tables.clients.contains_key(&stream) || tables.client_params.contains_key(&stream) {
            return Err(SyncError::DuplicateStream { stream });
        }
        tables.client_params.insert(stream, params);
        Ok(())
    }

    fn set_server(
        &self,
        stream: Stream,
        server: Box<dyn Server>,
        priority: u8,
    ) -> Result<Arc<ServerState>, SyncError> {
        let mut tables = self.tables();
        if tables.servers.contains_key(&stream) {
            return Err(SyncError::DuplicateStream { stream });
        }
        let (next_tx, next_rx) = mpsc::channel(1);
        // slot starts free: the first offer may go out immediately
        let _ = next_tx.try_send(());
        let state = Arc::new(ServerState {
            stream: stream.clone(),
            priority,
            server: Arc::from(server),
            current_batch: Mutex::new(Bytes::new()),
            next_tx,
            next: tokio::sync::Mutex::new(next_rx),
            quit: watch::channel(false).0,
            takeover: Mutex::new(None),
        });
        tables.servers.insert(stream, state.clone());
        Ok(state)
    }

    fn server(&self, stream: &Stream) -> Result<Arc<ServerState>, SyncError> {
        self.tables()
            .servers
            .get(stream)
            .cloned()
            .ok_or_else(|| SyncError::UnexpectedWant {
                stream: stream.clone(),
            })
    }

    /// Handle `UnsubscribeMsg` (or a local `quit`): remove and cancel the
    /// matching server.
    pub(crate) fn remove_server(&self, stream: &Stream) -> Result<(), SyncError> {
        let state = self
            .tables()
            .servers
            .remove(stream)
            .ok_or_else(|| SyncError::UnexpectedWant {
                stream: stream.clone(),
            })?;
        tracing::debug!(peer = %short_id(&self.id), stream = %stream, "server removed");
        state.close();
        Ok(())
    }

    /// Handle `QuitMsg` (or a local `unsubscribe`): remove and cancel the
    /// matching client, or the not-yet-materialized subscription.
    pub(crate) fn remove_client(&self, stream: &Stream) -> Result<(), SyncError> {
        let mut tables = self.tables();
        if let Some(state) = tables.clients.remove(stream) {
            drop(tables);
            tracing::debug!(peer = %short_id(&self.id), stream = %stream, "client removed");
            state.close();
            return Ok(());
        }
        if tables.client_params.remove(stream).is_some() {
            return Ok(());
        }
        Err(SyncError::UnexpectedOffer {
            stream: stream.clone(),
        })
    }

    fn get_or_set_client(&self, stream: &Stream, from: u64) -> Result<Arc<ClientState>, SyncError> {
        let registry = self.registry()?;
        let mut tables = self.tables();
        if let Some(state) = tables.clients.get(stream) {
            return Ok(state.clone());
        }
        let params =
            tables
                .client_params
                .remove(stream)
                .ok_or_else(|| SyncError::UnexpectedOffer {
                    stream: stream.clone(),
                })?;
        let client = registry.new_client(self.id, stream)?;
        let (next_tx, next_rx) = mpsc::channel(1);
        // the first WantedHashes may go out before any batch completes
        let _ = next_tx.try_send(Ok(()));
        let state = Arc::new(ClientState {
            stream: stream.clone(),
            priority: params.priority,
            to: params.to,
            client: Arc::from(client),
            session_at: AtomicU64::new(from),
            next_tx,
            next: tokio::sync::Mutex::new(next_rx),
            quit: watch::channel(false).0,
        });
        tables.clients.insert(stream.clone(), state.clone());
        Ok(state)
    }

    /// Tear down every endpoint. All quit channels close; in-flight waits
    /// unblock with `Cancelled`.
    pub(crate) fn close(&self) {
        let (servers, clients) = {
            let mut tables = self.tables();
            tables.client_params.clear();
            (
                tables.servers.drain().map(|(_, s)| s).collect::<Vec<_>>(),
                tables.clients.drain().map(|(_, c)| c).collect::<Vec<_>>(),
            )
        };
        for server in servers {
            server.close();
        }
        for client in clients {
            client.close();
        }
        let _ = self.quit.send(true);
    }

    // ── Subscription (server side) ───────────────────────────────────────────

    /// Handle `SubscribeMsg`: build the server endpoint(s) and launch the
    /// offer loop. Construction failures are reported back with
    /// `SubscribeErrorMsg`; the peer stays connected.
    pub(crate) async fn handle_subscribe(
        self: &Arc<Self>,
        req: SubscribeMsg,
    ) -> Result<(), SyncError> {
        tracing::debug!(
            peer = %short_id(&self.id),
            stream = %req.stream,
            history = ?req.history,
            "received subscription"
        );
        if let Err(err) = self.handle_subscribe_inner(&req) {
            metrics::incr(&metrics::global().subscribe_errors);
            tracing::warn!(
                peer = %short_id(&self.id),
                stream = %req.stream,
                error = %err,
                "subscription failed"
            );
            self.outbox
                .send(
                    &Message::SubscribeError(SubscribeErrorMsg {
                        error: err.to_string(),
                    }),
                    PRIORITY_HIGH,
                )
                .await?;
        }
        Ok(())
    }

    fn handle_subscribe_inner(self: &Arc<Self>, req: &SubscribeMsg) -> Result<(), SyncError> {
        let registry = self.registry()?;
        let server = registry.new_server(self.id, &req.stream)?;
        let state = self.set_server(req.stream.clone(), server, req.priority)?;

        let (from, to) = match (req.stream.live, req.history) {
            (false, Some(h)) => (h.from, h.to),
            _ => (0, 0),
        };
        self.spawn_offer(state, from, to);

        // A live subscription with history gets a paired historical server
        // under the derived stream id, one priority band down.
        if req.stream.live {
            if let Some(h) = req.history {
                let hist = req.stream.history();
                let server = registry.new_server(self.id, &hist)?;
                let state = self.set_server(hist, server, history_priority(req.priority))?;
                self.spawn_offer(state, h.from, h.to);
            }
        }
        Ok(())
    }

    // ── Offer loop (server side) ─────────────────────────────────────────────

    fn spawn_offer(self: &Arc<Self>, state: Arc<ServerState>, from: u64, to: u64) {
        let peer = self.clone();
        tokio::spawn(async move {
            match peer.offer_batch(&state, from, to).await {
                Ok(()) | Err(SyncError::Cancelled) => {}
                Err(e) => {
                    tracing::warn!(
                        peer = %short_id(&peer.id),
                        stream = %state.stream,
                        error = %e,
                        "offer failed, dropping peer"
                    );
                    peer.drop_with(e);
                }
            }
        });
    }

    /// One turn of the offer loop: wait for the slot, draw the next batch
    /// from the endpoint, emit `OfferedHashesMsg`.
    async fn offer_batch(&self, s: &ServerState, from: u64, to: u64) -> Result<(), SyncError> {
        let mut quit = s.quit.subscribe();
        {
            let mut slot = s.next.lock().await;
            tokio::select! {
                token = slot.recv() => {
                    if token.is_none() {
                        return Err(SyncError::Cancelled);
                    }
                }
                _ = quit.wait_for(|q| *q) => return Err(SyncError::Cancelled),
            }
        }
        let batch = tokio::select! {
            res = s.server.set_next_batch(from, to) => res?,
            _ = quit.wait_for(|q| *q) => return Err(SyncError::Cancelled),
        };
        let Some(batch) = batch else {
            return Err(SyncError::Cancelled);
        };
        *s.current_batch.lock().expect("current batch poisoned") = batch.hashes.clone();
        let msg = OfferedHashesMsg {
            stream: s.stream.clone(),
            from: batch.from,
            to: batch.to,
            hashes: batch.hashes,
            handover: batch.proof,
        };
        tracing::debug!(peer = %short_id(&self.id), offer = %msg, "offering batch");
        metrics::incr(&metrics::global().offers_sent);
        self.outbox.send(&Message::OfferedHashes(msg), s.priority).await
    }

    // ── Want and deliver (client side) ───────────────────────────────────────

    /// Handle `OfferedHashesMsg`: register interest per hash, await the
    /// previous batch through the one-slot channel, reply with
    /// `WantedHashesMsg` under the batch watchdog.
    pub(crate) async fn handle_offered_hashes(
        self: &Arc<Self>,
        req: OfferedHashesMsg,
    ) -> Result<(), SyncError> {
        let count = req.hashes.len() / HASH_SIZE;
        if count == 0 {
            return Err(SyncError::EmptyBatch { stream: req.stream });
        }
        if count > self.config.batch_size {
            return Err(SyncError::OversizedBatch {
                count,
                limit: self.config.batch_size,
            });
        }
        let c = self.get_or_set_client(&req.stream, req.from)?;

        let mut want = BitVector::new(count)?;
        let mut waiters = Vec::new();
        for i in 0..count {
            let mut addr = [0u8; HASH_SIZE];
            addr.copy_from_slice(&req.hashes[i * HASH_SIZE..(i + 1) * HASH_SIZE]);
            if let Some(waiter) = c.client.need_data(&addr)? {
                want.set(i, true);
                waiters.push(waiter);
            }
        }
        tracing::debug!(
            peer = %short_id(&self.id),
            offer = %req,
            wanted = waiters.len(),
            "received offered batch"
        );

        if req.stream.live {
            c.session_at.store(req.from, Ordering::Relaxed);
        }

        // Completion task: once every wanted chunk is stored, account the
        // batch and pass the outcome into the one-slot channel for the
        // next reply.
        {
            let peer = self.clone();
            let c = c.clone();
            let req = req.clone();
            tokio::spawn(async move {
                let mut quit = c.quit.subscribe();
                let waited = tokio::select! {
                    res = try_join_all(waiters.into_iter().map(|w| w.wait())) => {
                        res.map(|_| ()).map_err(SyncError::from)
                    }
                    _ = quit.wait_for(|q| *q) => return,
                };
                let outcome = match waited {
                    Ok(()) => peer.finish_batch(&c, &req).await,
                    Err(e) => Err(e),
                };
                tokio::select! {
                    _ = c.next_tx.send(outcome) => {}
                    _ = quit.wait_for(|q| *q) => {}
                }
            });
        }

        let (next_from, next_to) = c.next_batch(req.to);
        if next_from == 0 && next_to == 0 {
            // history exhausted; the server stays idle
            return Ok(());
        }
        let msg = WantedHashesMsg {
            stream: req.stream.clone(),
            want: Bytes::copy_from_slice(want.bytes()),
            from: next_from,
            to: next_to,
        };
        let peer = self.clone();
        tokio::spawn(async move {
            peer.send_wanted_hashes(&c, msg).await;
        });
        Ok(())
    }

    /// Send the reply for the current offer once the previous batch has
    /// fully arrived, or drop the peer on the batch watchdog.
    async fn send_wanted_hashes(&self, c: &ClientState, msg: WantedHashesMsg) {
        let timeout = self.config.batch_timeout();
        let mut quit = c.quit.subscribe();
        {
            let mut slot = c.next.lock().await;
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    metrics::incr(&metrics::global().batch_timeouts);
                    tracing::warn!(
                        peer = %short_id(&self.id),
                        stream = %c.stream,
                        "batch not delivered in time, dropping peer"
                    );
                    self.drop_with(SyncError::BatchTimeout(timeout));
                    return;
                }
                outcome = slot.recv() => match outcome {
                    Some(Ok(())) => {}
                    Some(Err(SyncError::Cancelled)) | None => return,
                    Some(Err(e)) => {
                        tracing::warn!(
                            peer = %short_id(&self.id),
                            stream = %c.stream,
                            error = %e,
                            "batch failed, dropping peer"
                        );
                        self.drop_with(e);
                        return;
                    }
                },
                _ = quit.wait_for(|q| *q) => return,
            }
        }
        tracing::debug!(peer = %short_id(&self.id), want = %msg, "sending want batch");
        if let Err(e) = self.outbox.send(&Message::WantedHashes(msg), c.priority).await {
            self.drop_with(e);
        }
    }

    /// Account a fully stored batch: surface the takeover-proof hook and,
    /// for a proving client that reached its history bound, tear the
    /// stream down.
    async fn finish_batch(&self, c: &ClientState, req: &OfferedHashesMsg) -> Result<(), SyncError> {
        let root = req
            .handover
            .as_ref()
            .map(|p| p.handover.root)
            .unwrap_or([0u8; HASH_SIZE]);
        if let Some(build) = c.client.batch_done(&req.stream, req.from, &req.hashes, &root) {
            let proof = build()?;
            let end = proof.takeover.end;
            self.outbox
                .send(&Message::TakeoverProof(TakeoverProofMsg { proof }), c.priority)
                .await?;
            if c.to > 0 && end >= c.to {
                self.registry()?.unsubscribe(self.id, &req.stream).await?;
            }
        }
        Ok(())
    }

    // ── Serve wanted hashes (server side) ────────────────────────────────────

    /// Handle `WantedHashesMsg`: free the slot, pipeline the next offer,
    /// then deliver every wanted chunk of the answered batch.
    pub(crate) async fn handle_wanted_hashes(
        self: &Arc<Self>,
        req: WantedHashesMsg,
    ) -> Result<(), SyncError> {
        metrics::incr(&metrics::global().wants_received);
        let s = self.server(&req.stream)?;
        let hashes = s.current_batch.lock().expect("current batch poisoned").clone();

        // The outstanding offer is answered: return the slot token and
        // overlap the next offer with this batch's deliveries.
        let _ = s.next_tx.try_send(());
        self.spawn_offer(s.clone(), req.from, req.to);

        let count = hashes.len() / HASH_SIZE;
        let want = BitVector::from_bytes(&req.want, count)
            .map_err(|_| SyncError::WantLengthMismatch { expected: count })?;
        tracing::debug!(peer = %short_id(&self.id), want = %req, "received wanted batch");

        let mut quit = s.quit.subscribe();
        for i in 0..count {
            if !want.get(i) {
                continue;
            }
            let mut addr = [0u8; HASH_SIZE];
            addr.copy_from_slice(&hashes[i * HASH_SIZE..(i + 1) * HASH_SIZE]);
            let data = tokio::select! {
                res = s.server.get_data(&addr) => res?,
                _ = quit.wait_for(|q| *q) => return Err(SyncError::Cancelled),
            };
            self.outbox
                .send(
                    &Message::ChunkDelivery(ChunkDeliveryMsg { addr, data }),
                    s.priority,
                )
                .await?;
            metrics::incr(&metrics::global().chunks_delivered);
        }
        Ok(())
    }

    // ── Deliveries and attestations ──────────────────────────────────────────

    /// Handle `ChunkDeliveryMsg`: store the chunk; storing resolves every
    /// pending request for the address.
    pub(crate) fn handle_chunk_delivery(&self, req: ChunkDeliveryMsg) -> Result<(), SyncError> {
        tracing::trace!(
            peer = %short_id(&self.id),
            addr = %hex::encode(&req.addr[..4]),
            len = req.data.len(),
            "chunk delivered"
        );
        self.registry()?.store().put(req.addr, req.data)?;
        metrics::incr(&metrics::global().chunks_received);
        Ok(())
    }

    /// Handle `TakeoverProofMsg`: record the strongest attestation for the
    /// stream. Signature verification is pluggable and absent here.
    pub(crate) fn handle_takeover_proof(&self, req: TakeoverProofMsg) -> Result<(), SyncError> {
        let s = self.server(&req.proof.takeover.stream)?;
        let mut strongest = s.takeover.lock().expect("takeover slot poisoned");
        let replace = strongest
            .as_ref()
            .map(|held| req.proof.takeover.end > held.takeover.end)
            .unwrap_or(true);
        if replace {
            *strongest = Some(req.proof);
        }
        Ok(())
    }
}
