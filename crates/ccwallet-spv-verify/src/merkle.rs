//! Merkle inclusion proofs for transactions.

use serde::{Deserialize, Serialize};

use crate::hash::{sha256d, Hash256};

/// A Merkle inclusion proof for a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// The authentication path (sibling hashes), leaf level first
    pub branch: Vec<Hash256>,
    /// Position of the transaction in the block; bit `i` set means the
    /// running hash is the right child at level `i`
    pub index: u32,
}

impl MerkleProof {
    /// Recompute the Merkle root committed to by this proof
    pub fn root(&self, txid: &Hash256) -> Hash256 {
        let mut current = txid.to_internal();
        for (level, sibling) in self.branch.iter().enumerate() {
            let sibling = sibling.to_internal();
            // Levels past the width of `index` are left children
            let bit = self.index.checked_shr(level as u32).unwrap_or(0) & 1;
            current = if bit == 1 {
                hash_pair(&sibling, &current)
            } else {
                hash_pair(&current, &sibling)
            };
        }
        Hash256::from_internal(current)
    }

    /// Verifies the proof against a header's Merkle root
    pub fn verify(&self, txid: &Hash256, merkle_root: &Hash256) -> bool {
        self.root(txid) == *merkle_root
    }
}

/// Build the inclusion proof for the transaction at `index` in a block's transaction list.
///
/// Returns `None` if the index is out of bounds.
pub fn merkle_branch(txids: &[Hash256], index: usize) -> Option<MerkleProof> {
    if index >= txids.len() {
        return None;
    }

    let mut layer: Vec<[u8; 32]> = txids.iter().map(Hash256::to_internal).collect();
    let mut branch = Vec::new();
    let mut position = index;

    while layer.len() > 1 {
        let sibling = if position % 2 == 1 {
            position - 1
        } else {
            // Odd layer length duplicates the last node
            (position + 1).min(layer.len() - 1)
        };
        branch.push(Hash256::from_internal(layer[sibling]));

        layer = layer
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => hash_pair(single, single),
                _ => unreachable!("chunks of at most two"),
            })
            .collect();
        position /= 2;
    }

    Some(MerkleProof {
        branch,
        index: index as u32,
    })
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}
