//! Shared harness for sync integration tests.
//!
//! Wires two registries back-to-back over in-memory channels, no real
//! networking. Every frame a node puts on the wire is recorded in a
//! transcript before being dispatched into the remote registry, so tests
//! can assert on exact message order.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::mpsc;

use shoal_core::wire::{ChunkDeliveryMsg, Message, OfferedHashesMsg, WantedHashesMsg};
use shoal_core::{Address, SyncConfig};
use shoal_store::bin::proximity;
use shoal_store::{chunk_address, ChunkResolver, ChunkWaiter, Fetched, MemChunkStore, StoreError};
use shoal_sync::{PeerId, Registry, Transport, TransportClosed};

pub use shoal_store::ChunkStore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

pub struct Node {
    pub id: PeerId,
    pub store: Arc<MemChunkStore>,
    pub registry: Arc<Registry>,
}

/// A node whose overlay address is `[tag; 32]`.
pub fn node(tag: u8, config: SyncConfig) -> Node {
    let id: Address = [tag; 32];
    let store = Arc::new(MemChunkStore::new(id));
    let registry = Registry::new(config, store.clone());
    Node { id, store, registry }
}

/// A node whose registry runs over a wrapping store (e.g. [`HoldStore`]);
/// `inner` stays available for direct inspection as `Node::store`.
pub fn node_with_store(
    tag: u8,
    config: SyncConfig,
    outer: Arc<dyn ChunkStore>,
    inner: Arc<MemChunkStore>,
) -> Node {
    let id: Address = [tag; 32];
    let registry = Registry::new(config, outer);
    Node {
        id,
        store: inner,
        registry,
    }
}

/// Mine a chunk whose address falls in `bin` relative to `base`.
/// Deterministic for a given (base, bin, seed).
pub fn mine_chunk(base: &Address, bin: u8, seed: u32) -> (Address, Bytes) {
    let mut salt = 0u32;
    loop {
        let mut data = BytesMut::with_capacity(12);
        data.put_u32(seed);
        data.put_u32(salt);
        data.put_slice(b"chunk");
        let data = data.freeze();
        let addr = chunk_address(&data);
        if proximity(base, &addr) == bin {
            return (addr, data);
        }
        salt += 1;
    }
}

/// Mine `n` distinct chunks for `bin` relative to `base`, without storing.
pub fn mine_chunks(base: &Address, bin: u8, n: u32) -> Vec<(Address, Bytes)> {
    (0..n).map(|seed| mine_chunk(base, bin, seed)).collect()
}

/// Mine and store `n` chunks under `bin` of `store`'s base address.
/// Returns them in local-index order.
pub fn put_chunks(store: &MemChunkStore, bin: u8, n: u32) -> Vec<(Address, Bytes)> {
    let chunks = mine_chunks(store.base(), bin, n);
    for (addr, data) in &chunks {
        store.put(*addr, data.clone()).expect("put mined chunk");
    }
    chunks
}

// ── Transport ─────────────────────────────────────────────────────────────────

struct ChannelTransport {
    tx: mpsc::Sender<(u8, Bytes)>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, code: u8, payload: Bytes) -> Result<(), TransportClosed> {
        self.tx.send((code, payload)).await.map_err(|_| TransportClosed)
    }
}

/// Everything one node put on the wire toward its peer, in order.
#[derive(Default)]
pub struct Transcript {
    messages: Mutex<Vec<Message>>,
}

impl Transcript {
    fn record(&self, code: u8, payload: &[u8]) {
        let msg = Message::decode(code, payload).expect("harness frames must decode");
        self.messages.lock().unwrap().push(msg);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn offers(&self) -> Vec<OfferedHashesMsg> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::OfferedHashes(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    pub fn wants(&self) -> Vec<WantedHashesMsg> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::WantedHashes(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    pub fn deliveries(&self) -> Vec<ChunkDeliveryMsg> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::ChunkDelivery(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    /// Index of the first message matching `pred`, if any.
    pub fn position(&self, pred: impl Fn(&Message) -> bool) -> Option<usize> {
        self.messages().iter().position(|m| pred(m))
    }
}

fn link(from: &Node, to: &Node) -> Arc<Transcript> {
    let (tx, mut rx) = mpsc::channel::<(u8, Bytes)>(64);
    let transcript = Arc::new(Transcript::default());
    from.registry
        .run_peer(to.id, Arc::new(ChannelTransport { tx }));

    let to_registry = to.registry.clone();
    let from_id = from.id;
    let recorder = transcript.clone();
    tokio::spawn(async move {
        while let Some((code, payload)) = rx.recv().await {
            recorder.record(code, &payload);
            to_registry.handle_message(from_id, code, &payload).await;
        }
    });
    transcript
}

/// Connect two nodes. Returns `(a_outbound, b_outbound)` transcripts.
pub fn connect(a: &Node, b: &Node) -> (Arc<Transcript>, Arc<Transcript>) {
    (link(a, b), link(b, a))
}

// ── Assertions under virtual time ─────────────────────────────────────────────

/// Poll `pred` until it holds, advancing (virtual) time. Panics with
/// `what` after `limit`.
pub async fn wait_until(what: &str, limit: Duration, pred: impl Fn() -> bool) {
    let step = Duration::from_millis(25);
    let mut waited = Duration::ZERO;
    while waited <= limit {
        if pred() {
            return;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    panic!("timed out waiting for: {what}");
}

/// Settle the engine: let a bit of (virtual) time pass.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

// ── A store that can stall chunk reads ────────────────────────────────────────

/// Wraps a [`MemChunkStore`] and reports held addresses as in-flight, so a
/// server's `get_data` blocks until the test releases them.
pub struct HoldStore {
    pub inner: Arc<MemChunkStore>,
    held: DashMap<Address, ChunkResolver>,
    failing: DashMap<Address, ()>,
}

impl HoldStore {
    pub fn new(inner: Arc<MemChunkStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            held: DashMap::new(),
            failing: DashMap::new(),
        })
    }

    /// Reads of `addr` report an in-flight request until released.
    pub fn hold(&self, addr: Address) {
        self.held.insert(addr, ChunkWaiter::pair().0);
    }

    pub fn release(&self, addr: &Address) {
        if let Some((_, resolver)) = self.held.remove(addr) {
            resolver.stored();
        }
    }

    /// Reads of `addr` fail with a backend error.
    pub fn fail(&self, addr: Address) {
        self.failing.insert(addr, ());
    }
}

impl ChunkStore for HoldStore {
    fn get(&self, addr: &Address) -> Result<Fetched, StoreError> {
        if self.failing.contains_key(addr) {
            return Err(StoreError::Backend("injected read failure".into()));
        }
        if let Some(resolver) = self.held.get(addr) {
            return Ok(Fetched::Pending(resolver.waiter()));
        }
        self.inner.get(addr)
    }

    fn get_or_create_request(
        &self,
        addr: &Address,
    ) -> Result<(Option<ChunkWaiter>, bool), StoreError> {
        self.inner.get_or_create_request(addr)
    }

    fn put(&self, addr: Address, data: Bytes) -> Result<(), StoreError> {
        self.inner.put(addr, data)
    }

    fn iterate(
        &self,
        bin: u8,
        from: u64,
        to: u64,
        f: &mut dyn FnMut(Address, u64) -> bool,
    ) -> Result<(), StoreError> {
        self.inner.iterate(bin, from, to, f)
    }

    fn current_index(&self, bin: u8) -> u64 {
        self.inner.current_index(bin)
    }
}
