//! Handshake and dispatch behaviour of a peer session, driven over an
//! in-memory duplex stream with a hand-rolled client side.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use apiary_core::identifiers::{Address, Key};
use apiary_net::transport;
use apiary_net::{
    run_peer, Hive, HiveParams, NetError, NetStore, NodeCtx, NoopPayment, SyncParams,
};
use apiary_proto::{
    Message, PeerAddr, RetrieveRequest, StatusMsg, NETWORK_ID, PROTOCOL_VERSION,
};
use apiary_store::local::{ChunkStore, LocalStore};
use apiary_store::requests::RequestDb;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("apiary_tests=debug,apiary_net=debug")
        .with_test_writer()
        .try_init();
}

struct Server {
    ctx: Arc<NodeCtx>,
    _dir: TempDir,
}

fn server() -> Server {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ChunkStore> =
        Arc::new(LocalStore::open(&dir.path().join("chunks")).unwrap());
    let request_db = RequestDb::open(&dir.path().join("requests")).unwrap();
    let cancel = CancellationToken::new();

    let self_key = vec![0xaa; 64];
    let self_addr = PeerAddr::new(vec![127, 0, 0, 1], 8500, Bytes::from(self_key));

    let (dial_tx, _dial_rx) = mpsc::unbounded_channel();
    let hive = Hive::new(
        self_addr.addr,
        HiveParams::default(),
        dir.path().join("peers.json"),
        dial_tx,
        cancel.clone(),
    );
    let netstore = Arc::new(NetStore::new(store.clone(), hive.clone()));

    let ctx = Arc::new(NodeCtx {
        hive,
        netstore,
        store,
        request_db,
        sync_params: Arc::new(SyncParams::default()),
        payment: Arc::new(NoopPayment),
        client_id: "apiary/test".into(),
        network_id: NETWORK_ID,
        self_addr,
        swap: None,
        sync_enabled: true,
        cancel,
    });
    Server { ctx, _dir: dir }
}

fn client_status(network_id: u64, version: u64) -> Message {
    Message::Status(StatusMsg {
        version,
        id: "remote/test".into(),
        addr: PeerAddr::new(vec![127, 0, 0, 1], 8501, Bytes::from(vec![0xbb; 64])),
        swap: None,
        network_id,
    })
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn handshake_registers_peer_and_negotiates_sync() {
    init_tracing();
    let server = server();
    let (client, stream) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(run_peer(stream, None, server.ctx.clone()));
    let (mut rx, mut tx) = transport::split(client);

    match rx.recv().await.unwrap().unwrap() {
        Message::Status(status) => {
            assert_eq!(status.version, PROTOCOL_VERSION);
            assert_eq!(status.network_id, NETWORK_ID);
        }
        other => panic!("expected status first, got code {:?}", other.code()),
    }
    tx.send(&client_status(NETWORK_ID, PROTOCOL_VERSION))
        .await
        .unwrap();

    // registration triggers a self lookup, then sync is negotiated
    match rx.recv().await.unwrap().unwrap() {
        Message::RetrieveRequest(req) => {
            assert!(req.key.is_zero());
            assert_eq!(req.id, 0);
        }
        other => panic!("expected self lookup, got code {:?}", other.code()),
    }
    match rx.recv().await.unwrap().unwrap() {
        Message::SyncRequest(msg) => assert!(msg.state.is_none(), "first session starts fresh"),
        other => panic!("expected sync request, got code {:?}", other.code()),
    }
    wait_for("peer registered", || server.ctx.hive.kad().count() == 1).await;

    drop(tx);
    drop(rx);
    assert!(handle.await.unwrap().is_ok());
    assert_eq!(server.ctx.hive.kad().count(), 0, "gone after disconnect");
}

#[tokio::test]
async fn network_id_mismatch_ends_the_session() {
    init_tracing();
    let server = server();
    let (client, stream) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(run_peer(stream, None, server.ctx.clone()));
    let (mut rx, mut tx) = transport::split(client);

    rx.recv().await.unwrap().unwrap();
    tx.send(&client_status(NETWORK_ID + 1, PROTOCOL_VERSION))
        .await
        .unwrap();

    let res = handle.await.unwrap();
    assert!(matches!(
        res,
        Err(NetError::NetworkIdMismatch { theirs, .. }) if theirs == NETWORK_ID + 1
    ));
    assert_eq!(server.ctx.hive.kad().count(), 0);
}

#[tokio::test]
async fn version_mismatch_ends_the_session() {
    init_tracing();
    let server = server();
    let (client, stream) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(run_peer(stream, None, server.ctx.clone()));
    let (mut rx, mut tx) = transport::split(client);

    rx.recv().await.unwrap().unwrap();
    tx.send(&client_status(NETWORK_ID, PROTOCOL_VERSION + 9))
        .await
        .unwrap();

    assert!(matches!(
        handle.await.unwrap(),
        Err(NetError::VersionMismatch { .. })
    ));
}

#[tokio::test]
async fn first_message_must_be_status() {
    init_tracing();
    let server = server();
    let (client, stream) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(run_peer(stream, None, server.ctx.clone()));
    let (mut rx, mut tx) = transport::split(client);

    rx.recv().await.unwrap().unwrap();
    tx.send(&Message::RetrieveRequest(RetrieveRequest {
        key: Key::new([1; 32]),
        id: 1,
        max_size: 0,
        max_peers: 0,
        timeout: 0,
    }))
    .await
    .unwrap();

    assert!(matches!(handle.await.unwrap(), Err(NetError::NoStatusMsg)));
}

#[tokio::test]
async fn repeated_status_ends_the_session() {
    init_tracing();
    let server = server();
    let (client, stream) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(run_peer(stream, None, server.ctx.clone()));
    let (mut rx, mut tx) = transport::split(client);

    rx.recv().await.unwrap().unwrap();
    tx.send(&client_status(NETWORK_ID, PROTOCOL_VERSION))
        .await
        .unwrap();
    wait_for("peer registered", || server.ctx.hive.kad().count() == 1).await;

    tx.send(&client_status(NETWORK_ID, PROTOCOL_VERSION))
        .await
        .unwrap();

    assert!(matches!(
        handle.await.unwrap(),
        Err(NetError::ExtraStatusMsg)
    ));
    assert_eq!(server.ctx.hive.kad().count(), 0);
}

#[tokio::test]
async fn announced_zero_ip_is_repaired_from_the_transport() {
    init_tracing();
    let server = server();
    let (client, stream) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(run_peer(
        stream,
        Some("10.1.2.3".parse().unwrap()),
        server.ctx.clone(),
    ));
    let (mut rx, mut tx) = transport::split(client);

    rx.recv().await.unwrap().unwrap();
    let remote = PeerAddr::new(vec![0, 0, 0, 0], 8501, Bytes::from(vec![0xbb; 64]));
    let remote_addr = remote.addr;
    tx.send(&Message::Status(StatusMsg {
        version: PROTOCOL_VERSION,
        id: "remote/test".into(),
        addr: remote,
        swap: None,
        network_id: NETWORK_ID,
    }))
    .await
    .unwrap();

    wait_for("peer registered", || server.ctx.hive.kad().count() == 1).await;
    let peers = server.ctx.hive.get_peers(Key::from(remote_addr), 1);
    assert_eq!(peers[0].peer_addr().url(), "10.1.2.3:8501");

    drop(tx);
    drop(rx);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn peer_without_a_syncer_cannot_sync() {
    init_tracing();
    let server = server();
    let (client, stream) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(run_peer(stream, None, server.ctx.clone()));
    let (mut rx, mut tx) = transport::split(client);

    rx.recv().await.unwrap().unwrap();
    tx.send(&client_status(NETWORK_ID, PROTOCOL_VERSION))
        .await
        .unwrap();
    // never answer the sync request, then ask for deliveries anyway
    tx.send(&Message::DeliveryRequest(apiary_proto::DeliveryRequestMsg {
        deliver: vec![],
    }))
    .await
    .unwrap();

    assert!(matches!(handle.await.unwrap(), Err(NetError::Sync(_))));
}

#[tokio::test]
async fn self_addr_is_excluded_from_lookup_answers() {
    init_tracing();
    // a node never hands out the asker's own record
    let server = server();
    let (client, stream) = tokio::io::duplex(64 * 1024);
    let _handle = tokio::spawn(run_peer(stream, None, server.ctx.clone()));
    let (mut rx, mut tx) = transport::split(client);

    rx.recv().await.unwrap().unwrap();
    tx.send(&client_status(NETWORK_ID, PROTOCOL_VERSION))
        .await
        .unwrap();
    wait_for("peer registered", || server.ctx.hive.kad().count() == 1).await;

    tx.send(&Message::RetrieveRequest(RetrieveRequest {
        key: Key::zero(),
        id: 0,
        max_size: 0,
        max_peers: 10,
        timeout: 0,
    }))
    .await
    .unwrap();

    let own = Address::from_public_key(&[0xbb; 64]);
    loop {
        match rx.recv().await.unwrap().unwrap() {
            Message::Peers(msg) => {
                assert!(msg.peers.iter().all(|p| p.addr != own));
                break;
            }
            _ => continue,
        }
    }
}
