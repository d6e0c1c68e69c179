//! The peer connection state machine.
//!
//! [`run_peer`] drives one connection from handshake to disconnect: it
//! exchanges status messages, registers the peer with the hive, wires
//! up the syncer and then dispatches incoming messages until the
//! stream closes or a protocol violation ends the session.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use apiary_core::identifiers::{Address, Key};
use apiary_proto::{
    Message, PeerAddr, PeersMsg, RetrieveRequest, StatusMsg, StoreRequest, SwapProfile,
    SyncRequest, SyncRequestMsg, SyncState, UnsyncedKeysMsg, PROTOCOL_VERSION,
};
use apiary_store::local::ChunkStore;
use apiary_store::requests::RequestDb;

use crate::hive::Hive;
use crate::netstore::NetStore;
use crate::syncer::{ReqType, SyncItem, SyncOut, SyncParams, Syncer};
use crate::transport;
use crate::NetError;

/// Hook for the accounting module: charged per chunk exchanged and
/// handed incoming payment promises.
pub trait PaymentHandler: Send + Sync {
    /// Credits (positive) or debits (negative) `units` against `peer`.
    fn add(&self, units: i64, peer: &Address);
    /// Validates and books a payment promise received from `peer`.
    fn receive(&self, units: u64, promise: &Bytes, peer: &Address) -> Result<(), String>;
}

/// Accounting disabled: all traffic is free.
pub struct NoopPayment;

impl PaymentHandler for NoopPayment {
    fn add(&self, _units: i64, _peer: &Address) {}
    fn receive(&self, _units: u64, _promise: &Bytes, _peer: &Address) -> Result<(), String> {
        Ok(())
    }
}

/// Everything a peer session needs from the node.
pub struct NodeCtx {
    /// Peer pool and routing table.
    pub hive: Arc<Hive>,
    /// Chunk storage with network fallback.
    pub netstore: Arc<NetStore>,
    /// The local chunk store, used directly by the syncer.
    pub store: Arc<dyn ChunkStore>,
    /// Backing database for the persistent sync queues.
    pub request_db: RequestDb,
    /// Syncer tunables shared by all sessions.
    pub sync_params: Arc<SyncParams>,
    /// Accounting hook.
    pub payment: Arc<dyn PaymentHandler>,
    /// Client name and build, sent in the handshake.
    pub client_id: String,
    /// Network identifier, sent in the handshake.
    pub network_id: u64,
    /// Our own address record, sent in the handshake.
    pub self_addr: PeerAddr,
    /// Settlement terms offered to peers.
    pub swap: Option<SwapProfile>,
    /// Whether sessions negotiate chunk synchronisation.
    pub sync_enabled: bool,
    /// Cancelled when the node shuts down.
    pub cancel: CancellationToken,
}

impl NodeCtx {
    fn status(&self) -> StatusMsg {
        StatusMsg {
            version: PROTOCOL_VERSION,
            id: self.client_id.clone(),
            addr: self.self_addr.clone(),
            swap: self.swap.clone(),
            network_id: self.network_id,
        }
    }
}

/// A live remote peer. Handed to the hive, the network store and the
/// syncer; all of them talk to the peer through its outbound queue.
pub struct BzzPeer {
    remote: PeerAddr,
    out: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    last_active: parking_lot::RwLock<Instant>,
    syncer: parking_lot::Mutex<Option<Arc<Syncer>>>,
    sync_state: parking_lot::Mutex<Option<SyncState>>,
    payment: Arc<dyn PaymentHandler>,
}

impl BzzPeer {
    /// Creates the handle around an outbound message queue.
    pub fn new(
        remote: PeerAddr,
        out: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
        payment: Arc<dyn PaymentHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            out,
            cancel,
            last_active: parking_lot::RwLock::new(Instant::now()),
            syncer: parking_lot::Mutex::new(None),
            sync_state: parking_lot::Mutex::new(None),
            payment,
        })
    }

    /// The peer's overlay address.
    pub fn addr(&self) -> Address {
        self.remote.addr
    }

    /// The peer's address record as announced in its handshake.
    pub fn peer_addr(&self) -> PeerAddr {
        self.remote.clone()
    }

    /// Queues a message. A closed queue means the writer died, which
    /// ends the session.
    pub fn send(&self, msg: Message) {
        if self.out.send(msg).is_err() {
            self.cancel.cancel();
        }
    }

    /// Forwards a retrieve request.
    pub fn retrieve(&self, req: RetrieveRequest) {
        self.send(Message::RetrieveRequest(req));
    }

    /// Sends chunk data, charging one unit for the service.
    pub fn store(&self, req: StoreRequest) {
        self.payment.add(1, &self.remote.addr);
        self.send(Message::StoreRequest(req));
    }

    /// Sends a peers message.
    pub fn peers(&self, msg: PeersMsg) {
        self.send(Message::Peers(msg));
    }

    /// Offers a key to this peer through its syncer, if the session
    /// negotiated one.
    pub fn propagate(&self, key: Key) {
        let syncer = self.syncer.lock().clone();
        if let Some(syncer) = syncer {
            tokio::spawn(async move {
                syncer
                    .add_request(SyncItem::Key(key), ReqType::Propagate)
                    .await;
            });
        }
    }

    /// The session's syncer, once sync has been negotiated.
    pub fn syncer(&self) -> Option<Arc<Syncer>> {
        self.syncer.lock().clone()
    }

    fn set_syncer(&self, syncer: Arc<Syncer>) {
        *self.syncer.lock() = Some(syncer);
    }

    /// Records the peer's latest self-reported sync state.
    pub fn set_sync_state(&self, state: Option<SyncState>) {
        *self.sync_state.lock() = state;
    }

    /// The peer's last reported sync state as a meta blob for the node
    /// record database.
    pub fn sync_state_json(&self) -> Option<serde_json::Value> {
        let state = self.sync_state.lock().clone();
        state.and_then(|s| serde_json::to_value(s).ok())
    }

    fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }
}

impl apiary_kad::Peer for BzzPeer {
    fn addr(&self) -> Address {
        self.remote.addr
    }

    fn url(&self) -> String {
        self.remote.url()
    }

    fn last_active(&self) -> Instant {
        *self.last_active.read()
    }

    fn disconnect(&self) {
        self.cancel.cancel();
    }
}

impl SyncOut for BzzPeer {
    fn unsynced_keys(&self, unsynced: Vec<SyncRequest>, state: SyncState) {
        self.send(Message::UnsyncedKeys(UnsyncedKeysMsg { unsynced, state }));
    }

    fn delivery_request(&self, deliver: Vec<SyncRequest>) {
        self.send(Message::DeliveryRequest(
            apiary_proto::DeliveryRequestMsg { deliver },
        ));
    }

    fn store(&self, req: StoreRequest) {
        self.store(req);
    }
}

/// Runs one peer session over `stream` until it ends. `remote_ip` is
/// the transport-level address, used to repair handshakes announcing
/// an unspecified IP.
pub async fn run_peer<S>(
    stream: S,
    remote_ip: Option<IpAddr>,
    ctx: Arc<NodeCtx>,
) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancel = ctx.cancel.child_token();
    let (mut reader, mut writer) = transport::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();

    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_cancel.cancelled() => return,
                maybe = out_rx.recv() => {
                    let Some(msg) = maybe else { return };
                    if let Err(err) = writer.send(&msg).await {
                        debug!(%err, "write failed");
                        writer_cancel.cancel();
                        return;
                    }
                }
            }
        }
    });

    let result = session(&mut reader, remote_ip, &ctx, &out_tx, &cancel).await;
    if let Err(err) = &result {
        warn!(%err, "peer session ended");
    }
    cancel.cancel();
    let _ = writer_task.await;
    result
}

async fn session<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut transport::MsgReader<R>,
    remote_ip: Option<IpAddr>,
    ctx: &Arc<NodeCtx>,
    out_tx: &mpsc::UnboundedSender<Message>,
    cancel: &CancellationToken,
) -> Result<(), NetError> {
    let _ = out_tx.send(Message::Status(ctx.status()));

    let first = tokio::select! {
        msg = reader.recv() => msg?,
        _ = cancel.cancelled() => return Ok(()),
    };
    let status = match first {
        Some(Message::Status(status)) => status,
        _ => return Err(NetError::NoStatusMsg),
    };
    if status.network_id != ctx.network_id {
        return Err(NetError::NetworkIdMismatch {
            ours: ctx.network_id,
            theirs: status.network_id,
        });
    }
    if status.version != PROTOCOL_VERSION {
        return Err(NetError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: status.version,
        });
    }

    let mut remote = status.addr;
    if remote.is_unspecified() {
        // NAT peers announce all zeros; the transport knows better
        if let Some(ip) = remote_ip {
            remote.ip = match ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
        }
    }
    info!(peer = %remote.addr, url = %remote.url(), client = %status.id, "peer connected");

    let peer = BzzPeer::new(remote, out_tx.clone(), cancel.clone(), ctx.payment.clone());
    let meta = ctx.hive.add_peer(peer.clone());

    if ctx.sync_enabled {
        // what we last learned about the peer's progress goes back to
        // it, so it can resume instead of rescanning
        let resumed = meta.and_then(|m| serde_json::from_value::<SyncState>(m).ok());
        peer.send(Message::SyncRequest(SyncRequestMsg { state: resumed }));
    }

    let result = dispatch(reader, ctx, &peer, cancel).await;

    ctx.hive.remove_peer(&peer);
    let syncer = peer.syncer.lock().take();
    if let Some(syncer) = syncer {
        syncer.stop().await;
    }
    info!(peer = %peer.addr(), "peer disconnected");
    result
}

async fn dispatch<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut transport::MsgReader<R>,
    ctx: &Arc<NodeCtx>,
    peer: &Arc<BzzPeer>,
    cancel: &CancellationToken,
) -> Result<(), NetError> {
    loop {
        let msg = tokio::select! {
            msg = reader.recv() => msg?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let Some(msg) = msg else { return Ok(()) };
        peer.touch();

        match msg {
            Message::Status(_) => return Err(NetError::ExtraStatusMsg),

            Message::StoreRequest(req) => {
                ctx.payment.add(-1, &peer.addr());
                ctx.netstore.add_store_request(req, peer)?;
            }

            Message::RetrieveRequest(req) => {
                ctx.netstore.add_retrieve_request(req, peer)?;
            }

            Message::Peers(msg) => {
                ctx.hive.add_peer_entries(&msg.peers);
            }

            Message::SyncRequest(msg) => {
                start_sync(ctx, peer, msg, cancel)?;
            }

            Message::DeliveryRequest(msg) => {
                let syncer = peer
                    .syncer()
                    .ok_or_else(|| NetError::Sync("delivery request before sync request".into()))?;
                syncer.handle_delivery_request(msg.deliver).await;
            }

            Message::UnsyncedKeys(msg) => {
                let syncer = peer
                    .syncer()
                    .ok_or_else(|| NetError::Sync("unsynced keys before sync request".into()))?;
                syncer.handle_unsynced_keys(msg.unsynced)?;
                peer.set_sync_state(Some(msg.state));
            }

            Message::Payment(msg) => {
                ctx.payment
                    .receive(msg.units, &msg.promise, &peer.addr())
                    .map_err(NetError::Accounting)?;
            }
        }
    }
}

/// Starts this side's syncer from the state the peer echoed back, or
/// from scratch for a peer never seen before.
fn start_sync(
    ctx: &Arc<NodeCtx>,
    peer: &Arc<BzzPeer>,
    msg: SyncRequestMsg,
    cancel: &CancellationToken,
) -> Result<(), NetError> {
    if !ctx.sync_enabled {
        debug!(peer = %peer.addr(), "ignoring sync request, sync disabled");
        return Ok(());
    }
    if peer.syncer().is_some() {
        return Err(NetError::Sync("sync request can only be sent once".into()));
    }
    let counter = ctx.store.counter();
    let mut state = msg.state.unwrap_or_else(|| {
        let (start, stop) = ctx.hive.kad().key_range(&peer.addr());
        SyncState::new(Key::from(start), Key::from(stop), counter)
    });
    state.session_at = counter;
    debug!(
        peer = %peer.addr(),
        session_at = state.session_at,
        last_seen_at = state.last_seen_at,
        synced = state.synced,
        "starting sync",
    );

    let syncer = Syncer::start(
        ctx.request_db.clone(),
        peer.addr(),
        ctx.store.clone(),
        peer.clone(),
        ctx.sync_params.clone(),
        state,
        cancel.child_token(),
    );
    peer.set_syncer(syncer);
    Ok(())
}
