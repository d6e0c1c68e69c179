//! Test node implementation for integration testing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tracing::info;

use apiary_core::identifiers::{Address, Key};
use apiary_net::{NetError, Node, NodeConfig};
use apiary_proto::NETWORK_ID;
use apiary_store::chunk::Chunk;

/// Configuration for a test node.
#[derive(Debug, Clone)]
pub struct TestNodeConfig {
    /// Listen address
    pub listen_addr: SocketAddr,
    /// Network identifier
    pub network_id: u64,
    /// Whether sessions negotiate chunk synchronisation
    pub sync_enabled: bool,
}

impl Default for TestNodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            network_id: NETWORK_ID,
            sync_enabled: true,
        }
    }
}

/// A real node on a temporary data directory, bound to loopback.
pub struct TestNode {
    /// The running node
    pub node: Arc<Node>,
    /// The node's overlay address
    pub addr: Address,
    /// Temporary data directory, removed on drop
    _temp_dir: TempDir,
}

impl TestNode {
    /// Creates and starts a test node.
    pub async fn start(config: TestNodeConfig) -> Result<Self, NetError> {
        let temp_dir = TempDir::new()?;
        let mut node_config = NodeConfig::new(temp_dir.path().to_path_buf(), 0);
        node_config.listen_addr = config.listen_addr;
        node_config.network_id = config.network_id;
        node_config.sync_enabled = config.sync_enabled;
        let addr = node_config.address()?;

        let node = Node::start(node_config).await?;
        info!(%addr, listen = %node.local_addr(), "test node started");

        Ok(Self {
            node,
            addr,
            _temp_dir: temp_dir,
        })
    }

    /// The node's dialling url.
    pub fn url(&self) -> String {
        format!("127.0.0.1:{}", self.node.local_addr().port())
    }

    /// Dials another test node.
    pub fn connect_to(&self, other: &TestNode) {
        self.node.connect(other.url());
    }

    /// Number of live connections in the routing table.
    pub fn connection_count(&self) -> usize {
        self.node.hive().kad().count()
    }

    /// Stores `data` as a chunk on this node, pushing it towards the
    /// closest peers. Returns the content address.
    pub fn put_data(&self, data: &[u8]) -> Result<Key, NetError> {
        let mut sdata = (data.len() as u64).to_le_bytes().to_vec();
        sdata.extend_from_slice(data);
        let chunk = Chunk::new(Bytes::from(sdata));
        let key = chunk.key;
        self.node.netstore().put(&chunk)?;
        Ok(key)
    }

    /// Retrieves a chunk, searching the network on a local miss.
    pub async fn get_chunk(&self, key: &Key) -> Result<Chunk, NetError> {
        self.node.netstore().get(key).await
    }

    /// Whether the chunk is in the local store.
    pub fn has_chunk(&self, key: &Key) -> bool {
        self.node.store().contains(key).unwrap_or(false)
    }

    /// Waits until `cond` holds or panics after `timeout`.
    pub async fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + timeout;
        while !cond() {
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Stops the node, flushing sync queues and node records.
    pub async fn shutdown(&self) {
        self.node.shutdown().await;
    }
}
