//! Stream registry — named stream kinds and the engine's peer table.
//!
//! The registry owns every connected peer's stream engine, maps stream
//! names to server/client factories, and is the single entry point for
//! inbound protocol messages. Higher layers decide *what* to subscribe to;
//! the registry and its peers run the offer/want/deliver machinery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use shoal_core::metrics;
use shoal_core::stream::{history_priority, PRIORITY_HIGH};
use shoal_core::wire::{HandoverProof, Message, SubscribeMsg, TakeoverProof, UnsubscribeMsg};
use shoal_core::{Address, Range, Stream, SyncConfig};
use shoal_store::{ChunkStore, ChunkWaiter};

use crate::error::SyncError;
use crate::outbox::{Outbox, WriterExit};
use crate::peer::{short_id, ClientParams, Peer};
use crate::syncer;
use crate::transport::Transport;

/// Overlay address of a connected peer.
pub type PeerId = Address;

/// A batch of hashes produced by a server endpoint.
#[derive(Debug, Clone)]
pub struct OfferedBatch {
    /// Packed 32-byte addresses, up to the configured batch size.
    pub hashes: Bytes,
    /// Adjusted start of the offered window.
    pub from: u64,
    /// One past the last offered index.
    pub to: u64,
    /// Attestation over the section, when the server is the proving kind.
    pub proof: Option<HandoverProof>,
}

/// Deferred takeover-proof construction returned by [`Client::batch_done`].
pub type ProofBuilder = Box<dyn FnOnce() -> Result<TakeoverProof, SyncError> + Send>;

/// Upstream endpoint of a stream: produces batches of hashes and serves
/// their payloads.
#[async_trait]
pub trait Server: Send + Sync {
    /// Produce the next batch of up to `batch_size` hashes within
    /// `[from, to)`. Blocks until at least one hash is available or the
    /// endpoint closes; `None` means closed.
    async fn set_next_batch(&self, from: u64, to: u64) -> Result<Option<OfferedBatch>, SyncError>;

    /// Fetch the payload for a previously offered hash. May block on a
    /// pending local request.
    async fn get_data(&self, addr: &Address) -> Result<Bytes, SyncError>;

    /// Cancel any blocked `set_next_batch`.
    fn close(&self);
}

/// Downstream endpoint of a stream: decides which offered hashes are
/// wanted and accounts for completed batches.
pub trait Client: Send + Sync {
    /// Register interest in a chunk. `None` means it is already local and
    /// no wait is needed; otherwise the waiter resolves when the chunk is
    /// delivered and stored.
    fn need_data(&self, addr: &Address) -> Result<Option<ChunkWaiter>, SyncError>;

    /// Called once every wanted chunk of a batch is stored. A proving
    /// client returns a deferred takeover-proof builder; `None` otherwise.
    fn batch_done(
        &self,
        stream: &Stream,
        from: u64,
        hashes: &[u8],
        root: &Address,
    ) -> Option<ProofBuilder>;

    fn close(&self);
}

/// Factory for server endpoints, keyed by stream name.
pub type ServerFunc =
    Box<dyn Fn(PeerId, &str, bool) -> Result<Box<dyn Server>, SyncError> + Send + Sync>;

/// Factory for client endpoints, keyed by stream name.
pub type ClientFunc =
    Box<dyn Fn(PeerId, &str, bool) -> Result<Box<dyn Client>, SyncError> + Send + Sync>;

/// A rejection reported asynchronously by the remote end of a
/// subscription. Surfaces on [`Registry::subscribe_errors`]; the peer
/// stays connected.
#[derive(Debug)]
pub struct SubscribeError {
    pub peer: PeerId,
    pub error: SyncError,
}

pub struct Registry {
    config: SyncConfig,
    store: Arc<dyn ChunkStore>,
    server_funcs: RwLock<HashMap<String, ServerFunc>>,
    client_funcs: RwLock<HashMap<String, ClientFunc>>,
    peers: DashMap<PeerId, Arc<Peer>>,
    sub_err_tx: mpsc::UnboundedSender<SubscribeError>,
    sub_err_rx: Mutex<Option<mpsc::UnboundedReceiver<SubscribeError>>>,
    drop_tx: mpsc::UnboundedSender<(PeerId, SyncError)>,
    drop_rx: Mutex<Option<mpsc::UnboundedReceiver<(PeerId, SyncError)>>>,
}

impl Registry {
    /// Create a registry over the local chunk store. The "SYNC" kind is
    /// registered unless disabled in configuration.
    pub fn new(config: SyncConfig, store: Arc<dyn ChunkStore>) -> Arc<Registry> {
        let (sub_err_tx, sub_err_rx) = mpsc::unbounded_channel();
        let (drop_tx, drop_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry {
            store: store.clone(),
            server_funcs: RwLock::new(HashMap::new()),
            client_funcs: RwLock::new(HashMap::new()),
            peers: DashMap::new(),
            sub_err_tx,
            sub_err_rx: Mutex::new(Some(sub_err_rx)),
            drop_tx,
            drop_rx: Mutex::new(Some(drop_rx)),
            config,
        });
        if registry.config.sync_enabled {
            syncer::register_sync(&registry, store, &registry.config);
        }
        registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Register a server factory for a stream kind.
    pub fn register_server_func(&self, name: impl Into<String>, f: ServerFunc) {
        self.server_funcs
            .write()
            .expect("server factories poisoned")
            .insert(name.into(), f);
    }

    /// Register a client factory for a stream kind.
    pub fn register_client_func(&self, name: impl Into<String>, f: ClientFunc) {
        self.client_funcs
            .write()
            .expect("client factories poisoned")
            .insert(name.into(), f);
    }

    pub(crate) fn new_server(
        &self,
        peer: PeerId,
        stream: &Stream,
    ) -> Result<Box<dyn Server>, SyncError> {
        let funcs = self.server_funcs.read().expect("server factories poisoned");
        let f = funcs
            .get(&stream.name)
            .ok_or_else(|| SyncError::UnknownStreamKind {
                name: stream.name.clone(),
            })?;
        f(peer, &stream.key, stream.live)
    }

    pub(crate) fn new_client(
        &self,
        peer: PeerId,
        stream: &Stream,
    ) -> Result<Box<dyn Client>, SyncError> {
        let funcs = self.client_funcs.read().expect("client factories poisoned");
        let f = funcs
            .get(&stream.name)
            .ok_or_else(|| SyncError::UnknownStreamKind {
                name: stream.name.clone(),
            })?;
        f(peer, &stream.key, stream.live)
    }

    // ── Peer lifecycle ───────────────────────────────────────────────────────

    /// Wire up a newly connected peer: one outbox writer task over the
    /// given transport, empty stream tables. Replaces any previous engine
    /// for the same id.
    pub fn run_peer(self: &Arc<Self>, peer_id: PeerId, transport: Arc<dyn Transport>) -> Arc<Peer> {
        let (outbox, driver) = Outbox::new(self.config.priority_bands, self.config.per_band_queue);
        let peer = Peer::new(peer_id, Arc::downgrade(self), outbox, self.config.clone());
        if let Some(old) = self.peers.insert(peer_id, peer.clone()) {
            old.close();
        }
        tracing::debug!(peer = %short_id(&peer_id), "peer connected");
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if driver.run(transport).await == WriterExit::TransportClosed {
                if let Some(registry) = weak.upgrade() {
                    registry.drop_peer(&peer_id, SyncError::TransportClosed);
                }
            }
        });
        peer
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|p| p.value().clone())
    }

    /// Tear down every endpoint of a peer. Idempotent.
    pub fn drop_peer(&self, peer_id: &PeerId, err: SyncError) {
        if let Some((_, peer)) = self.peers.remove(peer_id) {
            metrics::incr(&metrics::global().peers_dropped);
            tracing::warn!(peer = %short_id(peer_id), error = %err, "dropping peer");
            peer.close();
            let _ = self.drop_tx.send((*peer_id, err));
        }
    }

    /// The overlay observed the peer disconnect.
    pub fn disconnected(&self, peer_id: &PeerId) {
        self.drop_peer(peer_id, SyncError::TransportClosed);
    }

    /// Tear down all peers. In-flight waits unblock with `Cancelled`.
    pub fn shutdown(&self) {
        let ids: Vec<PeerId> = self.peers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.drop_peer(&id, SyncError::Cancelled);
        }
    }

    /// Take the subscribe-error channel. Yields once per remote rejection.
    pub fn subscribe_errors(&self) -> Option<mpsc::UnboundedReceiver<SubscribeError>> {
        self.sub_err_rx.lock().expect("subscribe errors poisoned").take()
    }

    /// Take the peer-drop channel. Yields `(peer, reason)` per teardown.
    pub fn peer_drops(&self) -> Option<mpsc::UnboundedReceiver<(PeerId, SyncError)>> {
        self.drop_rx.lock().expect("peer drops poisoned").take()
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    /// Ask `peer` to stream to us. Registers the local client parameters
    /// (and the paired historical ones for a live stream with history) and
    /// sends `SubscribeMsg`. Local failures return synchronously; a remote
    /// rejection arrives on [`Registry::subscribe_errors`].
    pub async fn subscribe(
        &self,
        peer_id: PeerId,
        stream: Stream,
        history: Option<Range>,
        priority: u8,
    ) -> Result<(), SyncError> {
        {
            let funcs = self.client_funcs.read().expect("client factories poisoned");
            if !funcs.contains_key(&stream.name) {
                return Err(SyncError::UnknownStreamKind {
                    name: stream.name.clone(),
                });
            }
        }
        if let Some(h) = history {
            if h.to > 0 && h.from >= h.to {
                return Err(SyncError::InvalidArgument(format!(
                    "history range {h} is empty"
                )));
            }
        }
        let peer = self.peer(&peer_id).ok_or(SyncError::UnknownPeer)?;

        let to = match (stream.live, history) {
            (false, Some(h)) => h.to,
            _ => 0,
        };
        peer.set_client_params(stream.clone(), ClientParams { priority, to })?;
        if stream.live {
            if let Some(h) = history {
                peer.set_client_params(
                    stream.history(),
                    ClientParams {
                        priority: history_priority(priority),
                        to: h.to,
                    },
                )?;
            }
        }
        tracing::debug!(peer = %short_id(&peer_id), stream = %stream, history = ?history, "subscribing");
        peer.send_message(
            &Message::Subscribe(SubscribeMsg {
                stream,
                history,
                priority,
            }),
            priority,
        )
        .await
    }

    /// Stop consuming a stream: the remote removes its server, we remove
    /// our client.
    pub async fn unsubscribe(&self, peer_id: PeerId, stream: &Stream) -> Result<(), SyncError> {
        let peer = self.peer(&peer_id).ok_or(SyncError::UnknownPeer)?;
        peer.send_message(
            &Message::Unsubscribe(UnsubscribeMsg {
                stream: stream.clone(),
            }),
            PRIORITY_HIGH,
        )
        .await?;
        peer.remove_client(stream)
    }

    /// Stop serving a stream: the remote removes its client, we remove
    /// our server.
    pub async fn quit(&self, peer_id: PeerId, stream: &Stream) -> Result<(), SyncError> {
        let peer = self.peer(&peer_id).ok_or(SyncError::UnknownPeer)?;
        peer.send_message(
            &Message::Quit(shoal_core::wire::QuitMsg {
                stream: stream.clone(),
            }),
            PRIORITY_HIGH,
        )
        .await?;
        peer.remove_server(stream)
    }

    /// Ask `peer` to subscribe to one of our streams: it will send
    /// `SubscribeMsg` back and we become the upstream.
    pub async fn request_subscription(
        &self,
        peer_id: PeerId,
        stream: Stream,
        history: Option<Range>,
        priority: u8,
    ) -> Result<(), SyncError> {
        let peer = self.peer(&peer_id).ok_or(SyncError::UnknownPeer)?;
        peer.send_message(
            &Message::RequestSubscription(shoal_core::wire::RequestSubscriptionMsg {
                stream,
                history,
                priority,
            }),
            priority,
        )
        .await
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────────

    /// Entry point for the transport's receive loop: one framed message in
    /// arrival order. Handler errors are contained here per the
    /// propagation policy; at most the containing peer is dropped.
    pub async fn handle_message(self: &Arc<Self>, peer_id: PeerId, code: u8, payload: &[u8]) {
        let Some(peer) = self.peer(&peer_id) else {
            tracing::debug!(peer = %short_id(&peer_id), code, "message for unknown peer");
            return;
        };
        let msg = match Message::decode(code, payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.drop_peer(&peer_id, SyncError::Wire(e));
                return;
            }
        };
        let result = match msg {
            Message::Subscribe(m) => peer.handle_subscribe(m).await,
            Message::SubscribeError(m) => {
                metrics::incr(&metrics::global().subscribe_errors);
                tracing::warn!(peer = %short_id(&peer_id), error = %m.error, "subscription rejected by peer");
                let _ = self.sub_err_tx.send(SubscribeError {
                    peer: peer_id,
                    error: SyncError::SubscribeRejected(m.error),
                });
                Ok(())
            }
            Message::Unsubscribe(m) => peer.remove_server(&m.stream),
            Message::Quit(m) => peer.remove_client(&m.stream),
            Message::RequestSubscription(m) => {
                self.subscribe(peer_id, m.stream, m.history, m.priority).await
            }
            Message::OfferedHashes(m) => peer.handle_offered_hashes(m).await,
            Message::WantedHashes(m) => peer.handle_wanted_hashes(m).await,
            Message::ChunkDelivery(m) => peer.handle_chunk_delivery(m),
            Message::TakeoverProof(m) => peer.handle_takeover_proof(m),
        };
        match result {
            Ok(()) => {}
            Err(SyncError::Cancelled) => {}
            Err(e) if e.drops_peer() => self.drop_peer(&peer_id, e),
            Err(e) => {
                tracing::debug!(peer = %short_id(&peer_id), error = %e, "stream operation failed")
            }
        }
    }
}
