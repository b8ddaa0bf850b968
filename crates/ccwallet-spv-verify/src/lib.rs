//! SPV verification primitives for the colored-coin wallet
//!
//! This crate provides the synchronous building blocks of header chain verification:
//! the 80-byte header codec, difficulty retargeting, header chain validation and
//! Merkle inclusion proofs. It performs no I/O.

pub mod hash;
pub mod header;
pub mod merkle;
pub mod verify;
pub mod work;

pub use hash::{sha256d, Hash256};
pub use header::{
    chunk_hash, identity_hash, split_chunk, Header, HeaderError, HeaderRecord, RawHeader,
    CHUNK_SIZE, HEADER_SIZE,
};
pub use merkle::{merkle_branch, MerkleProof};
pub use verify::{ChainValidator, VerifyError};
pub use work::{retarget, ChainParams, Target};
