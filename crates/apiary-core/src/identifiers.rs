//! Overlay identifier types.
//!
//! Two 32-byte identifiers exist in the overlay:
//! - `Address` - node identity, derived as BLAKE3(public_key)
//! - `Key` - content address of a chunk
//!
//! Both live in the same XOR metric space: a chunk key is stored by the
//! nodes whose addresses are nearest to it, so addresses and keys convert
//! freely into one another.

use std::cmp::Ordering;
use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::wire::{WireDecode, WireEncode, WireError};
use crate::ADDRESS_BITS;

/// Macro to define a 32-byte identifier type with common implementations.
macro_rules! define_id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Creates a new identifier from a 32-byte array.
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Creates a zero identifier.
            pub const fn zero() -> Self {
                Self([0u8; 32])
            }

            /// Returns true for the all-zero identifier.
            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }

            /// Returns the inner bytes.
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Returns the inner bytes as a slice.
            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }

            /// Creates from a hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 32 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            /// Returns as a hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Generates a uniformly random identifier.
            pub fn random() -> Self {
                use rand::RngCore;
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Computes the XOR distance to `other`.
            pub fn xor_distance(&self, other: &Self) -> [u8; 32] {
                let mut result = [0u8; 32];
                for i in 0..32 {
                    result[i] = self.0[i] ^ other.0[i];
                }
                result
            }

            /// Proximity order: the number of leading bits `self` and
            /// `other` share. Equal identifiers yield 256.
            pub fn proximity(&self, other: &Self) -> usize {
                leading_zero_bits(&self.xor_distance(other))
            }

            /// Orders `x` and `y` by XOR distance from `self`.
            ///
            /// `Less` means `x` is strictly closer to `self` than `y`.
            pub fn prox_cmp(&self, x: &Self, y: &Self) -> Ordering {
                for i in 0..32 {
                    let dx = x.0[i] ^ self.0[i];
                    let dy = y.0[i] ^ self.0[i];
                    match dx.cmp(&dy) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                Ordering::Equal
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; 32] {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        // Persisted as lowercase hex, matching the on-disk JSON formats.
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(D::Error::custom)
            }
        }

        impl WireEncode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                self.0.encode(buf);
            }
        }

        impl WireDecode for $name {
            fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
                Ok(Self(<[u8; 32]>::decode(buf)?))
            }
        }
    };
}

define_id_type!(
    /// Overlay address of a node, derived as BLAKE3(public_key).
    ///
    /// Determines which region of the key space the node is
    /// responsible for.
    Address
);

define_id_type!(
    /// Content address of a chunk: BLAKE3(chunk payload).
    Key
);

impl Address {
    /// Derives an address from a node's public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    /// Constructs the address whose first `proximity(self, other) + 1`
    /// bits are taken from `other` and whose remaining bits are all
    /// copies of `fill`.
    ///
    /// With `fill = 0x00` and `fill = 0xff` this yields the inclusive
    /// bounds of the key interval both peers are responsible for.
    pub fn common_bits_address(&self, other: &Address, fill: u8) -> Address {
        let prefix = (self.proximity(other) + 1).min(ADDRESS_BITS);
        let mut out = [fill; 32];
        let full = prefix / 8;
        out[..full].copy_from_slice(&other.0[..full]);
        let rem = prefix % 8;
        if rem > 0 {
            let mask = 0xffu8 << (8 - rem);
            out[full] = (other.0[full] & mask) | (fill & !mask);
        }
        Address(out)
    }

    /// Generates a random address at exactly proximity order `po` from
    /// `self` (for `po < 256`).
    pub fn random_address_at(&self, po: usize) -> Address {
        use rand::RngCore;
        let mut bytes = self.0;
        if po < ADDRESS_BITS {
            let mut rnd = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut rnd);
            let byte = po / 8;
            let bit = po % 8;
            let keep = if bit == 0 { 0 } else { 0xffu8 << (8 - bit) };
            let flip = 0x80u8 >> bit;
            let rest = !(keep | flip);
            bytes[byte] = (self.0[byte] & keep) | (!self.0[byte] & flip) | (rnd[byte] & rest);
            bytes[byte + 1..].copy_from_slice(&rnd[byte + 1..]);
        }
        Address(bytes)
    }
}

impl Key {
    /// Computes the content address of a chunk payload.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl From<Address> for Key {
    fn from(addr: Address) -> Self {
        Self(addr.0)
    }
}

impl From<Key> for Address {
    fn from(key: Key) -> Self {
        Self(key.0)
    }
}

fn leading_zero_bits(bytes: &[u8; 32]) -> usize {
    let mut zeros = 0usize;
    for byte in bytes {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros() as usize;
            break;
        }
    }
    zeros
}
