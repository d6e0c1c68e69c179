//! Apiary Core - identifier types and wire primitives for the apiary
//! storage overlay.
//!
//! This crate provides:
//! - 32-byte identifier types (`Address` for overlay nodes, `Key` for chunks)
//! - XOR-metric proximity math (proximity order, distance comparison)
//! - Common-bits address construction for sync key ranges
//! - Wire encoding primitives (little-endian integers, length-prefixed
//!   sequences, varints)

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod identifiers;
pub mod wire;

pub use identifiers::*;
pub use wire::{WireDecode, WireEncode, WireError};

/// Number of bits in an overlay address.
pub const ADDRESS_BITS: usize = 256;
