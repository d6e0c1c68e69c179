//! Node assembly: storage, hive, listener and dialler.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use apiary_kad::NodeRecord;
use apiary_proto::PeerAddr;
use apiary_store::local::{ChunkStore, LocalStore};
use apiary_store::requests::RequestDb;

use crate::config::NodeConfig;
use crate::hive::{Hive, HiveParams};
use crate::netstore::NetStore;
use crate::protocol::{run_peer, NodeCtx, NoopPayment, PaymentHandler};
use crate::syncer::SyncParams;
use crate::NetError;

/// A running node: accepts inbound connections, dials nodes the hive
/// advises, and serves the chunk stores over the wire protocol.
pub struct Node {
    ctx: Arc<NodeCtx>,
    hive: Arc<Hive>,
    netstore: Arc<NetStore>,
    local_addr: std::net::SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Node {
    /// Brings up a node from its configuration: opens the stores,
    /// loads the node records, binds the listener and starts the
    /// connection upkeep tasks.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>, NetError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let addr = config.address()?;
        let public_key = config.public_key()?;

        let store: Arc<dyn ChunkStore> =
            Arc::new(LocalStore::open(&config.data_dir.join("chunks"))?);
        let request_db = RequestDb::open(&config.data_dir.join("requests"))?;

        let cancel = CancellationToken::new();
        let (dial_tx, mut dial_rx) = mpsc::unbounded_channel::<NodeRecord>();
        let hive = Hive::new(
            addr,
            HiveParams::default(),
            config.data_dir.join("bzz-peers.json"),
            dial_tx,
            cancel.clone(),
        );
        hive.start();

        let netstore = Arc::new(NetStore::new(store.clone(), hive.clone()));

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%addr, listen = %local_addr, "node up");

        let payment: Arc<dyn PaymentHandler> = Arc::new(NoopPayment);
        let swap = match &config.swap {
            Some(swap) => Some(swap.to_profile()?),
            None => None,
        };
        let ctx = Arc::new(NodeCtx {
            hive: hive.clone(),
            netstore: netstore.clone(),
            store,
            request_db,
            sync_params: Arc::new(SyncParams::default()),
            payment,
            client_id: config.client_id.clone(),
            network_id: config.network_id,
            self_addr: PeerAddr {
                ip: match local_addr.ip() {
                    std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
                    std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
                },
                port: local_addr.port(),
                id: Bytes::from(public_key),
                addr,
            },
            swap,
            sync_enabled: config.sync_enabled,
            cancel: cancel.clone(),
        });

        let tracker = TaskTracker::new();

        let accept_ctx = ctx.clone();
        let accept_cancel = cancel.clone();
        let accept_tracker = tracker.clone();
        tracker.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "inbound connection");
                        let ctx = accept_ctx.clone();
                        accept_tracker.spawn(async move {
                            let _ = run_peer(stream, Some(remote.ip()), ctx).await;
                        });
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
        });

        let dial_ctx = ctx.clone();
        let dial_cancel = cancel.clone();
        let dial_tracker = tracker.clone();
        tracker.spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = dial_cancel.cancelled() => return,
                    maybe = dial_rx.recv() => match maybe {
                        Some(record) => record,
                        None => return,
                    },
                };
                let ctx = dial_ctx.clone();
                dial_tracker.spawn(connect_to(record.url, ctx));
            }
        });

        Ok(Arc::new(Self {
            ctx,
            hive,
            netstore,
            local_addr,
            cancel,
            tracker,
        }))
    }

    /// Dials a node by `host:port` url.
    pub fn connect(&self, url: impl Into<String>) {
        self.tracker.spawn(connect_to(url.into(), self.ctx.clone()));
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// The peer pool.
    pub fn hive(&self) -> &Arc<Hive> {
        &self.hive
    }

    /// The chunk store with network fallback.
    pub fn netstore(&self) -> &Arc<NetStore> {
        &self.netstore
    }

    /// The local chunk store.
    pub fn store(&self) -> Arc<dyn ChunkStore> {
        self.ctx.store.clone()
    }

    /// Stops accepting and dialling, waits for every session to flush
    /// its sync queues, then persists the node records.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.hive.stop();
    }
}

async fn connect_to(url: String, ctx: Arc<NodeCtx>) {
    debug!(%url, "dialling");
    match TcpStream::connect(&url).await {
        Ok(stream) => {
            let remote_ip = stream.peer_addr().ok().map(|a| a.ip());
            let _ = run_peer(stream, remote_ip, ctx).await;
        }
        Err(err) => debug!(%url, %err, "dial failed"),
    }
}
