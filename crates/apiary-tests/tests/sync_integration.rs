//! Chunk synchronisation between live nodes.

use std::time::Duration;

use apiary_core::identifiers::Key;
use apiary_tests::{TestNode, TestNodeConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("apiary_tests=debug,apiary_net=debug")
        .with_test_writer()
        .try_init();
}

async fn pair() -> (TestNode, TestNode) {
    let a = TestNode::start(TestNodeConfig::default()).await.unwrap();
    // keep the shared key range wide so random chunks fall in it
    loop {
        let b = TestNode::start(TestNodeConfig::default()).await.unwrap();
        if a.addr.proximity(&b.addr) <= 4 {
            return (a, b);
        }
        b.shutdown().await;
    }
}

async fn connect_and_wait(a: &TestNode, b: &TestNode) {
    a.connect_to(b);
    TestNode::wait_for("nodes connected", Duration::from_secs(5), || {
        a.connection_count() >= 1 && b.connection_count() >= 1
    })
    .await;
}

#[tokio::test]
async fn live_chunks_reach_the_closest_peer() {
    init_tracing();
    let (a, b) = pair().await;
    connect_and_wait(&a, &b).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let key = a.put_data(b"fresh honey").unwrap();
    TestNode::wait_for("chunk propagated", Duration::from_secs(10), || {
        b.has_chunk(&key)
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn history_is_offered_after_connecting() {
    init_tracing();
    let (a, b) = pair().await;

    // content stored while the peer was away
    let mut keys: Vec<Key> = Vec::new();
    let mut payload = 0u32;
    while keys.len() < 200 {
        let key = a.put_data(&payload.to_le_bytes()).unwrap();
        keys.push(key);
        payload += 1;
    }
    let (start, stop) = (
        a.addr.common_bits_address(&b.addr, 0x00),
        a.addr.common_bits_address(&b.addr, 0xff),
    );
    let in_range: Vec<Key> = keys
        .iter()
        .copied()
        .filter(|k| start.0 <= k.0 && k.0 <= stop.0)
        .collect();
    assert!(!in_range.is_empty(), "some chunks fall in the shared range");

    connect_and_wait(&a, &b).await;
    TestNode::wait_for("history synced", Duration::from_secs(20), || {
        in_range.iter().all(|k| b.has_chunk(k))
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn known_chunks_are_not_delivered_again() {
    init_tracing();
    let (a, b) = pair().await;
    connect_and_wait(&a, &b).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // the same content on both sides
    let key = a.put_data(b"already everywhere").unwrap();
    let key_b = b.put_data(b"already everywhere").unwrap();
    assert_eq!(key, key_b);

    let counter_before = b.node.store().counter();
    tokio::time::sleep(Duration::from_secs(2)).await;
    // offers for the key are answered without asking for delivery, so
    // the store counter does not move
    assert_eq!(b.node.store().counter(), counter_before);

    a.shutdown().await;
    b.shutdown().await;
}
