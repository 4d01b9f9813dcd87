//! Offer/deliver pipelining: the next offer overlaps the previous batch's
//! deliveries.

mod common;

use std::sync::Arc;
use std::time::Duration;

use shoal_core::stream::PRIORITY_HIGH;
use shoal_core::wire::Message;
use shoal_core::{Stream, SyncConfig};
use shoal_store::MemChunkStore;
use shoal_sync::SYNC_STREAM_NAME;

use common::*;

const WIRE: Duration = Duration::from_secs(10);

/// With batch size 2 and four chunks, B's reply to offer #1 triggers
/// offer #2 before the deliveries of batch #1 complete: offer #2 is on
/// the wire before the last `ChunkDelivery` of batch #1.
#[tokio::test(start_paused = true)]
async fn next_offer_overlaps_previous_deliveries() {
    init_tracing();
    let config = SyncConfig {
        batch_size: 2,
        ..SyncConfig::default()
    };

    let inner = Arc::new(MemChunkStore::new([0xaa; 32]));
    let hold = HoldStore::new(inner.clone());
    let a = node_with_store(0xaa, config.clone(), hold.clone(), inner.clone());
    let b = node(0xbb, config);
    let (a_out, b_out) = connect(&a, &b);

    b.registry
        .subscribe(
            a.id,
            Stream::new(SYNC_STREAM_NAME, "0", true),
            None,
            PRIORITY_HIGH,
        )
        .await
        .unwrap();
    settle().await;

    let chunks = mine_chunks(&a.id, 0, 4);
    // stall the read of the last chunk of batch #1
    hold.hold(chunks[1].0);
    for (addr, data) in &chunks {
        inner.put(*addr, data.clone()).unwrap();
    }

    // batch #1 is offered and wanted in full
    wait_until("offer #1", WIRE, || a_out.offers().len() == 1).await;
    wait_until("want #1", WIRE, || b_out.wants().len() == 1).await;
    assert_eq!(&b_out.wants()[0].want[..], &[0b11]);

    // offer #2 goes out while delivery of batch #1 is stalled on h2
    wait_until("offer #2", WIRE, || a_out.offers().len() == 2).await;
    assert_eq!(
        a_out.deliveries().len(),
        1,
        "h2 is stalled; only h1 delivered so far"
    );
    let offers = a_out.offers();
    assert_eq!((offers[1].from, offers[1].to), (2, 4));

    hold.release(&chunks[1].0);
    wait_until("batch #1 completes", WIRE, || a_out.deliveries().len() >= 2).await;

    let second_offer_at = a_out
        .position(|m| matches!(m, Message::OfferedHashes(o) if o.from == 2))
        .expect("offer #2 recorded");
    let last_delivery_at = a_out
        .position(|m| matches!(m, Message::ChunkDelivery(d) if d.addr == chunks[1].0))
        .expect("h2 delivery recorded");
    assert!(
        second_offer_at < last_delivery_at,
        "offer #2 must be on the wire before the last delivery of batch #1"
    );

    // the session still converges: every chunk lands on B
    wait_until("B stores all four", WIRE, || {
        chunks.iter().all(|(addr, _)| b.store.contains(addr))
    })
    .await;
}
