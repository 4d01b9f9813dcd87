//! In-memory chunk store.
//!
//! Chunks live in a concurrent map keyed by content address; each
//! proximity bin keeps an append-only vector of addresses whose position
//! is the chunk's local index. Pending requests are watch channels owned
//! by the store and resolved on `put`.

use std::sync::Mutex;

use bytes::Bytes;
use dashmap::DashMap;

use shoal_core::Address;

use crate::bin::{proximity, MAX_PO};
use crate::{chunk_address, ChunkResolver, ChunkStore, ChunkWaiter, Fetched, StoreError};

pub struct MemChunkStore {
    /// Local overlay address; chunk bins are proximity to this.
    base: Address,
    chunks: DashMap<Address, Bytes>,
    /// Append-only per-bin index. Position in the vector is the local index.
    bins: Mutex<Vec<Vec<Address>>>,
    pending: DashMap<Address, ChunkResolver>,
}

impl MemChunkStore {
    pub fn new(base: Address) -> Self {
        Self {
            base,
            chunks: DashMap::new(),
            bins: Mutex::new(vec![Vec::new(); MAX_PO as usize + 1]),
            pending: DashMap::new(),
        }
    }

    /// The node's overlay address this store bins against.
    pub fn base(&self) -> &Address {
        &self.base
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.chunks.contains_key(addr)
    }

    /// Number of chunks stored across all bins.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Resolve every outstanding pending request with `Cancelled`.
    /// Called on shutdown so no waiter blocks forever.
    pub fn cancel_all_pending(&self) {
        self.pending.retain(|_, resolver| {
            resolver.cancelled();
            false
        });
    }

    fn resolve_pending(&self, addr: &Address) {
        if let Some((_, resolver)) = self.pending.remove(addr) {
            resolver.stored();
        }
    }
}

impl ChunkStore for MemChunkStore {
    fn get(&self, addr: &Address) -> Result<Fetched, StoreError> {
        if let Some(data) = self.chunks.get(addr) {
            return Ok(Fetched::Present(data.clone()));
        }
        if let Some(resolver) = self.pending.get(addr) {
            return Ok(Fetched::Pending(resolver.waiter()));
        }
        Ok(Fetched::NotFound)
    }

    fn get_or_create_request(
        &self,
        addr: &Address,
    ) -> Result<(Option<ChunkWaiter>, bool), StoreError> {
        if self.chunks.contains_key(addr) {
            return Ok((None, false));
        }
        let mut created = false;
        let waiter = {
            let entry = self.pending.entry(*addr).or_insert_with(|| {
                created = true;
                ChunkWaiter::pair().0
            });
            entry.waiter()
        };
        // A put may have raced the registration; resolve immediately if so.
        if self.chunks.contains_key(addr) {
            self.resolve_pending(addr);
        }
        Ok((Some(waiter), created))
    }

    fn put(&self, addr: Address, data: Bytes) -> Result<(), StoreError> {
        if chunk_address(&data) != addr {
            return Err(StoreError::AddressMismatch);
        }
        let newly_stored = {
            let mut inserted = false;
            self.chunks.entry(addr).or_insert_with(|| {
                inserted = true;
                data
            });
            inserted
        };
        if newly_stored {
            let bin = proximity(&self.base, &addr);
            let mut bins = self.bins.lock().expect("bin index poisoned");
            bins[bin as usize].push(addr);
            tracing::trace!(
                addr = %hex_prefix(&addr),
                bin,
                idx = bins[bin as usize].len() - 1,
                "chunk stored"
            );
        }
        self.resolve_pending(&addr);
        Ok(())
    }

    fn iterate(
        &self,
        bin: u8,
        from: u64,
        to: u64,
        f: &mut dyn FnMut(Address, u64) -> bool,
    ) -> Result<(), StoreError> {
        // Snapshot the requested slice under the lock, yield outside it so
        // concurrent puts never deadlock against a slow consumer.
        let snapshot: Vec<(Address, u64)> = {
            let bins = self.bins.lock().expect("bin index poisoned");
            let index = &bins[bin.min(MAX_PO) as usize];
            let end = to.min(index.len() as u64);
            if from >= end {
                return Ok(());
            }
            (from..end).map(|i| (index[i as usize], i)).collect()
        };
        for (addr, idx) in snapshot {
            if !f(addr, idx) {
                break;
            }
        }
        Ok(())
    }

    fn current_index(&self, bin: u8) -> u64 {
        let bins = self.bins.lock().expect("bin index poisoned");
        bins[bin.min(MAX_PO) as usize].len() as u64
    }
}

fn hex_prefix(addr: &Address) -> String {
    addr[..4].iter().map(|b| format!("{b:02x}")).collect()
}
