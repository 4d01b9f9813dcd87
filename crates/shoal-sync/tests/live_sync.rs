//! Live stream synchronization over in-memory channels.

mod common;

use std::time::Duration;

use shoal_core::stream::PRIORITY_HIGH;
use shoal_core::wire::Message;
use shoal_core::{Stream, SyncConfig};
use shoal_sync::SYNC_STREAM_NAME;

use common::*;

fn config(batch_size: usize) -> SyncConfig {
    SyncConfig {
        batch_size,
        ..SyncConfig::default()
    }
}

fn sync_stream(live: bool) -> Stream {
    Stream::new(SYNC_STREAM_NAME, "0", live)
}

const WIRE: Duration = Duration::from_secs(10);

/// Peers A, B; bin 0; batch size 3. A stores h1..h3 after B subscribes
/// live; B already holds h2. One offer `[0,3)`, one reply wanting bits
/// 0b101 with the open-ended window `[3,3)`, and deliveries for h1 and h3
/// in index order.
#[tokio::test(start_paused = true)]
async fn live_subscribe_single_batch() {
    init_tracing();
    let a = node(0xaa, config(3));
    let b = node(0xbb, config(3));
    let (a_out, b_out) = connect(&a, &b);

    let stream = sync_stream(true);
    b.registry
        .subscribe(a.id, stream.clone(), None, PRIORITY_HIGH)
        .await
        .unwrap();
    settle().await;

    let chunks = mine_chunks(&a.id, 0, 3);
    // B has the middle chunk already
    b.store.put(chunks[1].0, chunks[1].1.clone()).unwrap();
    for (addr, data) in &chunks {
        a.store.put(*addr, data.clone()).unwrap();
    }

    wait_until("offer from A", WIRE, || a_out.offers().len() == 1).await;
    let offer = a_out.offers().remove(0);
    assert_eq!(offer.stream, stream);
    assert_eq!((offer.from, offer.to), (0, 3));
    let mut packed = Vec::new();
    for (addr, _) in &chunks {
        packed.extend_from_slice(addr);
    }
    assert_eq!(&offer.hashes[..], &packed[..]);

    wait_until("want reply from B", WIRE, || b_out.wants().len() == 1).await;
    let want = b_out.wants().remove(0);
    assert_eq!(want.stream, stream);
    assert_eq!(&want.want[..], &[0b101]);
    assert_eq!((want.from, want.to), (3, 3));

    wait_until("deliveries from A", WIRE, || a_out.deliveries().len() == 2).await;
    let deliveries = a_out.deliveries();
    assert_eq!(deliveries[0].addr, chunks[0].0);
    assert_eq!(deliveries[1].addr, chunks[2].0);

    wait_until("B stores the batch", WIRE, || {
        chunks.iter().all(|(addr, _)| b.store.contains(addr))
    })
    .await;

    // nothing past the session tail: the single offer stands
    settle().await;
    assert_eq!(a_out.offers().len(), 1);
    assert_eq!(a_out.deliveries().len(), 2);
}

/// A live server offers nothing stored before the subscription point.
#[tokio::test(start_paused = true)]
async fn live_stream_starts_at_the_session_boundary() {
    init_tracing();
    let a = node(0xaa, config(8));
    let b = node(0xbb, config(8));
    let (a_out, _b_out) = connect(&a, &b);

    let pre = put_chunks(&a.store, 0, 2);
    b.registry
        .subscribe(a.id, sync_stream(true), None, PRIORITY_HIGH)
        .await
        .unwrap();
    settle().await;
    assert!(a_out.offers().is_empty(), "history must not leak into live");

    let (addr, data) = mine_chunk(&a.id, 0, 99);
    a.store.put(addr, data).unwrap();

    wait_until("tail offer", WIRE, || a_out.offers().len() == 1).await;
    let offer = a_out.offers().remove(0);
    assert_eq!((offer.from, offer.to), (2, 3));
    assert_eq!(&offer.hashes[..], &addr[..]);
    assert!(!pre.iter().any(|(a0, _)| a0 == &addr));
}

/// Two consecutive batches: offers stay serialized (at most one
/// outstanding), windows are continuous, every chunk is delivered once,
/// and each want bitvector covers exactly the offered batch.
#[tokio::test(start_paused = true)]
async fn multi_batch_live_round_trip() {
    init_tracing();
    let a = node(0xaa, config(2));
    let b = node(0xbb, config(2));
    let (a_out, b_out) = connect(&a, &b);

    let stream = sync_stream(true);
    b.registry
        .subscribe(a.id, stream.clone(), None, PRIORITY_HIGH)
        .await
        .unwrap();
    settle().await;

    let chunks = put_chunks(&a.store, 0, 4);

    wait_until("B stores all four chunks", WIRE, || {
        chunks.iter().all(|(addr, _)| b.store.contains(addr))
    })
    .await;

    let offers = a_out.offers();
    let wants = b_out.wants();
    assert_eq!(offers.len(), 2);
    assert_eq!((offers[0].from, offers[0].to), (0, 2));
    assert_eq!((offers[1].from, offers[1].to), (2, 4));
    // iterator continuity across offers
    assert_eq!(offers[1].from, offers[0].to);
    // an offer is only ever emitted once the previous one was answered
    assert!(offers.len() <= wants.len() + 1);

    // one bit per offered hash
    for (offer, want) in offers.iter().zip(wants.iter()) {
        assert_eq!(want.want.len(), offer.count().div_ceil(8));
    }

    // no duplicate deliveries within the session
    let delivered: Vec<_> = a_out.deliveries().iter().map(|d| d.addr).collect();
    let mut unique = delivered.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), delivered.len());
    assert_eq!(delivered.len(), 4);
}

/// If the store keeps a full batch ready and the peer answers promptly,
/// the server reaches the tail within the poll cadence.
#[tokio::test(start_paused = true)]
async fn responsive_peer_drains_backlog() {
    init_tracing();
    let a = node(0xaa, config(4));
    let b = node(0xbb, config(4));
    let (a_out, _b_out) = connect(&a, &b);

    b.registry
        .subscribe(a.id, sync_stream(true), None, PRIORITY_HIGH)
        .await
        .unwrap();
    settle().await;

    let chunks = put_chunks(&a.store, 0, 12);
    wait_until("backlog fully synced", Duration::from_secs(30), || {
        chunks.iter().all(|(addr, _)| b.store.contains(addr))
    })
    .await;
    assert_eq!(a_out.offers().len(), 3);

    // transcript carries no protocol noise beyond the expected codes
    for msg in a_out.messages() {
        assert!(matches!(
            msg,
            Message::OfferedHashes(_) | Message::ChunkDelivery(_)
        ));
    }
}
