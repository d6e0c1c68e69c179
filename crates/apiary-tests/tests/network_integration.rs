//! End-to-end tests over real loopback TCP nodes.

use std::time::Duration;

use apiary_net::NetError;
use apiary_tests::{TestNetwork, TestNode};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("apiary_tests=debug,apiary_net=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn two_nodes_connect_and_register_each_other() {
    init_tracing();
    let network = TestNetwork::with_nodes(2).await.unwrap();
    network.node(0).unwrap().connect_to(network.node(1).unwrap());
    network
        .wait_for_connections(1, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(network.total_connections(), 2);
    network.shutdown().await;
}

#[tokio::test]
async fn chunk_is_retrieved_across_the_network() {
    init_tracing();
    let network = TestNetwork::with_nodes(2).await.unwrap();
    let a = network.node(0).unwrap().clone();
    let b = network.node(1).unwrap().clone();
    a.connect_to(&b);
    network
        .wait_for_connections(1, Duration::from_secs(5))
        .await
        .unwrap();

    let key = a.put_data(b"swarm of bees").unwrap();
    let chunk = b.get_chunk(&key).await.unwrap();
    assert_eq!(chunk.key, key);
    assert!(b.has_chunk(&key), "retrieved chunks are kept locally");
    network.shutdown().await;
}

#[tokio::test]
async fn missing_chunk_search_times_out() {
    init_tracing();
    let network = TestNetwork::with_nodes(2).await.unwrap();
    let a = network.node(0).unwrap().clone();
    let b = network.node(1).unwrap().clone();
    a.connect_to(&b);
    network
        .wait_for_connections(1, Duration::from_secs(5))
        .await
        .unwrap();

    let nowhere = apiary_core::identifiers::Key::new([0x42; 32]);
    assert!(matches!(
        b.get_chunk(&nowhere).await,
        Err(NetError::NotFound)
    ));
    network.shutdown().await;
}

#[tokio::test]
async fn peer_records_spread_and_get_dialled() {
    // hub learns both spokes; the second spoke hears about the first
    // through its self lookup and dials it on its own
    init_tracing();
    let mut network = TestNetwork::new();
    let hub = network.add_node().await.unwrap();
    let spoke1 = network.add_node().await.unwrap();
    spoke1.connect_to(&hub);
    network
        .wait_for_connections(1, Duration::from_secs(5))
        .await
        .unwrap();

    let spoke2 = network.add_node().await.unwrap();
    spoke2.connect_to(&hub);

    TestNode::wait_for("full mesh via discovery", Duration::from_secs(15), || {
        spoke1.connection_count() == 2 && spoke2.connection_count() == 2
    })
    .await;
    assert!(spoke2.node.hive().kad().db_count() >= 1);
    network.shutdown().await;
}
