//! Test network harness for multi-node integration testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

use apiary_core::identifiers::Address;
use apiary_net::NetError;

use crate::node::{TestNode, TestNodeConfig};

/// A test network containing multiple nodes.
#[derive(Default)]
pub struct TestNetwork {
    nodes: Vec<Arc<TestNode>>,
    node_map: HashMap<Address, Arc<TestNode>>,
}

impl TestNetwork {
    /// Creates a new empty test network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a test network with the specified number of nodes.
    pub async fn with_nodes(count: usize) -> Result<Self, NetError> {
        let mut network = Self::new();
        for _ in 0..count {
            network.add_node().await?;
        }
        Ok(network)
    }

    /// Adds a new node to the network.
    pub async fn add_node(&mut self) -> Result<Arc<TestNode>, NetError> {
        let node = Arc::new(TestNode::start(TestNodeConfig::default()).await?);
        self.nodes.push(node.clone());
        self.node_map.insert(node.addr, node.clone());
        info!(addr = %node.addr, total = self.nodes.len(), "added node to test network");
        Ok(node)
    }

    /// Returns the number of nodes in the network.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns all nodes in the network.
    pub fn nodes(&self) -> &[Arc<TestNode>] {
        &self.nodes
    }

    /// Returns a node by index.
    pub fn node(&self, index: usize) -> Option<&Arc<TestNode>> {
        self.nodes.get(index)
    }

    /// Returns a node by overlay address.
    pub fn node_by_addr(&self, addr: &Address) -> Option<&Arc<TestNode>> {
        self.node_map.get(addr)
    }

    /// Connects all nodes in a mesh topology.
    pub async fn connect_mesh(&self) {
        for i in 0..self.nodes.len() {
            for j in (i + 1)..self.nodes.len() {
                self.nodes[i].connect_to(&self.nodes[j]);
            }
        }
        sleep(Duration::from_millis(100)).await;
        info!(nodes = self.nodes.len(), "connected nodes in mesh topology");
    }

    /// Connects nodes in a ring topology.
    pub async fn connect_ring(&self) {
        if self.nodes.len() < 2 {
            return;
        }
        for i in 0..self.nodes.len() {
            let next = (i + 1) % self.nodes.len();
            self.nodes[i].connect_to(&self.nodes[next]);
        }
        sleep(Duration::from_millis(100)).await;
        info!(nodes = self.nodes.len(), "connected nodes in ring topology");
    }

    /// Connects nodes in a star topology, the first node being the
    /// hub.
    pub async fn connect_star(&self) {
        if self.nodes.len() < 2 {
            return;
        }
        let hub = &self.nodes[0];
        for spoke in &self.nodes[1..] {
            spoke.connect_to(hub);
        }
        sleep(Duration::from_millis(100)).await;
        info!(nodes = self.nodes.len(), "connected nodes in star topology");
    }

    /// Waits for all nodes to have at least `min_connections` live
    /// peers.
    pub async fn wait_for_connections(
        &self,
        min_connections: usize,
        timeout: Duration,
    ) -> Result<(), &'static str> {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self
                .nodes
                .iter()
                .all(|n| n.connection_count() >= min_connections)
            {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
        Err("timeout waiting for connections")
    }

    /// Returns total connection count across all nodes.
    pub fn total_connections(&self) -> usize {
        self.nodes.iter().map(|n| n.connection_count()).sum()
    }

    /// Stops every node in the network.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}
