//! Block header codec: 80-byte wire form, identity hash and chunk helpers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{sha256d, Hash256};

/// Size of a serialized block header
pub const HEADER_SIZE: usize = 80;

/// Number of headers in a chunk (one retarget period)
pub const CHUNK_SIZE: u32 = 2016;

/// Serialized block header
pub type RawHeader = [u8; HEADER_SIZE];

/// Errors produced while encoding or decoding headers and chunks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header must be 80 bytes, got {0}")]
    InvalidLength(usize),
    #[error("header field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("invalid hash `{0}`: expected 64 hex characters")]
    InvalidHash(String),
    #[error("chunk of {0} bytes is not a sequence of 1..=2016 headers")]
    InvalidChunk(usize),
}

/// Block header with both hashes in display byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub prev_block_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl Header {
    /// Serialize into the 80-byte little-endian wire layout
    pub fn encode(&self) -> RawHeader {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(&self.prev_block_hash.to_internal());
        buf[36..68].copy_from_slice(&self.merkle_root.to_internal());
        buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Deserialize from the 80-byte wire layout
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() != HEADER_SIZE {
            return Err(HeaderError::InvalidLength(bytes.len()));
        }
        Ok(Self {
            version: read_u32(bytes, 0),
            prev_block_hash: Hash256::from_internal(read_hash(bytes, 4)),
            merkle_root: Hash256::from_internal(read_hash(bytes, 36)),
            timestamp: read_u32(bytes, 68),
            bits: read_u32(bytes, 72),
            nonce: read_u32(bytes, 76),
        })
    }

    /// Identity hash of the header
    pub fn id(&self) -> Hash256 {
        identity_hash(&self.encode())
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn read_hash(bytes: &[u8], offset: usize) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[offset..offset + 32]);
    hash
}

/// Double SHA-256 of a serialized header, in display order
pub fn identity_hash(raw: &[u8]) -> Hash256 {
    Hash256::from_internal(sha256d(raw))
}

/// Hash of a serialized chunk (concatenated headers), in display order
pub fn chunk_hash(chunk: &[u8]) -> Hash256 {
    Hash256::from_internal(sha256d(chunk))
}

/// Split a serialized chunk into individual headers.
pub fn split_chunk(chunk: &[u8]) -> Result<Vec<RawHeader>, HeaderError> {
    let count = chunk.len() / HEADER_SIZE;
    if chunk.is_empty() || chunk.len() % HEADER_SIZE != 0 || count > CHUNK_SIZE as usize {
        return Err(HeaderError::InvalidChunk(chunk.len()));
    }
    Ok(chunk
        .chunks_exact(HEADER_SIZE)
        .map(|raw| {
            let mut header = [0u8; HEADER_SIZE];
            header.copy_from_slice(raw);
            header
        })
        .collect())
}

/// Loosely typed header as delivered by remote data sources.
///
/// Numeric fields are wide signed integers and hashes are hex strings, so the
/// conversion into [`Header`] is the place where range and format checks happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRecord {
    pub version: i64,
    /// `None` for the genesis header
    pub prev_block_hash: Option<String>,
    pub merkle_root: String,
    pub timestamp: i64,
    pub bits: i64,
    pub nonce: i64,
}

fn checked_u32(field: &'static str, value: i64) -> Result<u32, HeaderError> {
    u32::try_from(value).map_err(|_| HeaderError::OutOfRange { field, value })
}

impl TryFrom<HeaderRecord> for Header {
    type Error = HeaderError;

    fn try_from(record: HeaderRecord) -> Result<Self, Self::Error> {
        let prev_block_hash = match record.prev_block_hash {
            Some(hash) => Hash256::from_hex(&hash)?,
            None => Hash256::ZERO,
        };
        Ok(Self {
            version: checked_u32("version", record.version)?,
            prev_block_hash,
            merkle_root: Hash256::from_hex(&record.merkle_root)?,
            timestamp: checked_u32("timestamp", record.timestamp)?,
            bits: checked_u32("bits", record.bits)?,
            nonce: checked_u32("nonce", record.nonce)?,
        })
    }
}

impl From<&Header> for HeaderRecord {
    fn from(header: &Header) -> Self {
        let prev_block_hash =
            (header.prev_block_hash != Hash256::ZERO).then(|| header.prev_block_hash.to_string());
        Self {
            version: header.version.into(),
            prev_block_hash,
            merkle_root: header.merkle_root.to_string(),
            timestamp: header.timestamp.into(),
            bits: header.bits.into(),
            nonce: header.nonce.into(),
        }
    }
}

/// Search for a nonce that makes the header satisfy `target`.
///
/// Only practical against easy targets; used to build synthetic chains.
#[cfg(any(test, feature = "test-utils"))]
pub fn mine(header: &mut Header, target: &crate::work::Target) {
    loop {
        if target.is_met_by(&header.id()) {
            return;
        }
        header.nonce = header.nonce.wrapping_add(1);
    }
}
