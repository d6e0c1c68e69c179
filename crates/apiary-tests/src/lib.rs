//! Integration test harness for multi-node testing.
//!
//! Spins up real nodes on loopback TCP and wires them into small
//! topologies so the integration tests can exercise retrieval,
//! propagation and synchronisation end to end.

#![deny(unsafe_code)]

pub mod harness;
pub mod node;

pub use harness::TestNetwork;
pub use node::{TestNode, TestNodeConfig};
