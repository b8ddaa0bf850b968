//! 32-byte identifiers in display (big-endian) byte order.

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{sha256d as sha256d_hash, Hash as _};
use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::header::HeaderError;

/// Block, transaction or Merkle node identifier.
///
/// Bytes are kept in display order, i.e. reversed relative to the digest produced
/// by [`sha256d`]. Comparing two values byte by byte compares them as 256-bit
/// big-endian integers.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Wrap bytes that are already in display order.
    pub const fn from_display_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Wrap a digest in internal (wire) byte order.
    pub fn from_internal(mut bytes: [u8; 32]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    /// Bytes in internal (wire) byte order.
    pub fn to_internal(&self) -> [u8; 32] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character hex string in display order.
    pub fn from_hex(s: &str) -> Result<Self, HeaderError> {
        if s.len() != 64 {
            return Err(HeaderError::InvalidHash(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| HeaderError::InvalidHash(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Double SHA-256 digest in internal byte order.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256d_hash::Hash::hash(data).to_byte_array()
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

impl FromStr for Hash256 {
    type Err = HeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<Txid> for Hash256 {
    fn from(txid: Txid) -> Self {
        Self::from_internal(txid.to_byte_array())
    }
}

impl From<BlockHash> for Hash256 {
    fn from(hash: BlockHash) -> Self {
        Self::from_internal(hash.to_byte_array())
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
