//! Node configuration, persisted as JSON in the data directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use apiary_core::identifiers::Address;
use apiary_proto::{SwapProfile, NETWORK_ID};

use crate::NetError;

/// Settlement terms, as stored in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Price offered for a delivered chunk.
    pub buy_at: u64,
    /// Price asked for a delivered chunk.
    pub sell_at: u64,
    /// Number of units after which payment is expected.
    pub pay_at: u64,
    /// Settlement beneficiary, hex encoded.
    pub beneficiary: String,
}

impl SwapConfig {
    /// Converts to the wire representation.
    pub fn to_profile(&self) -> Result<SwapProfile, NetError> {
        let raw = hex::decode(&self.beneficiary)
            .map_err(|e| NetError::Config(format!("beneficiary: {e}")))?;
        let beneficiary: [u8; 20] = raw
            .try_into()
            .map_err(|_| NetError::Config("beneficiary must be 20 bytes".into()))?;
        Ok(SwapProfile {
            buy_at: self.buy_at,
            sell_at: self.sell_at,
            pay_at: self.pay_at,
            beneficiary,
        })
    }
}

/// Node configuration. One file per node identity; the file name is
/// the hex overlay address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the node listens on.
    pub listen_addr: SocketAddr,
    /// Where chunks, node records and queues live.
    pub data_dir: PathBuf,
    /// Network this node takes part in.
    pub network_id: u64,
    /// Client name and build announced to peers.
    pub client_id: String,
    /// Hex encoded 64 byte transport public key. The overlay address
    /// is its hash.
    pub node_key: String,
    /// Whether sessions negotiate chunk synchronisation.
    pub sync_enabled: bool,
    /// Settlement terms, absent when accounting is disabled.
    pub swap: Option<SwapConfig>,
}

impl NodeConfig {
    /// Fresh configuration with a random node identity.
    pub fn new(data_dir: PathBuf, port: u16) -> Self {
        use rand::RngCore;
        let mut key = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            data_dir,
            network_id: NETWORK_ID,
            client_id: format!("apiary/{}", env!("CARGO_PKG_VERSION")),
            node_key: hex::encode(key),
            sync_enabled: true,
            swap: None,
        }
    }

    /// The node's transport public key.
    pub fn public_key(&self) -> Result<Vec<u8>, NetError> {
        let key = hex::decode(&self.node_key)
            .map_err(|e| NetError::Config(format!("node_key: {e}")))?;
        if key.len() != 64 {
            return Err(NetError::Config(format!(
                "node_key must be 64 bytes, got {}",
                key.len()
            )));
        }
        Ok(key)
    }

    /// The overlay address derived from the node key.
    pub fn address(&self) -> Result<Address, NetError> {
        Ok(Address::from_public_key(&self.public_key()?))
    }

    /// Loads the configuration found in `data_dir`, or creates and
    /// saves a fresh one listening on `port`.
    pub fn load_or_create(data_dir: &Path, port: u16) -> Result<Self, NetError> {
        if data_dir.is_dir() {
            for entry in std::fs::read_dir(data_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(raw) = std::fs::read_to_string(&path) else {
                    continue;
                };
                if let Ok(config) = serde_json::from_str::<NodeConfig>(&raw) {
                    info!(path = %path.display(), "configuration loaded");
                    return Ok(config);
                }
            }
        }
        let config = Self::new(data_dir.to_path_buf(), port);
        config.save()?;
        info!(addr = %config.address()?, "new node identity created");
        Ok(config)
    }

    /// Writes the configuration to its place in the data directory.
    pub fn save(&self) -> Result<(), NetError> {
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join(format!("{}.json", self.address()?.to_hex()));
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| NetError::Config(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}
