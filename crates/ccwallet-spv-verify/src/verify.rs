//! Header chain validation: linkage, proof-of-work and the testnet minimum-difficulty rule.

use thiserror::Error;
use tracing::debug;

use crate::hash::Hash256;
use crate::header::Header;
use crate::work::{ChainParams, Target, TESTNET_MIN_DIFFICULTY_GAP};

/// Reasons a header is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("header {id} at height {height} does not link to previous block {expected}")]
    ChainLinkage {
        height: u32,
        id: Hash256,
        expected: Hash256,
    },
    #[error("header {id} at height {height} fails proof of work (bits {bits:#010x})")]
    ProofOfWork { height: u32, id: Hash256, bits: u32 },
}

/// Stateless header validator parameterized by the chain rules
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainValidator {
    params: ChainParams,
}

impl ChainValidator {
    pub fn new(params: ChainParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Check a single header against its predecessor and the expected target of its period.
    ///
    /// `prev` is `None` only for the first header of the chain, in which case `prev_id`
    /// is the all-zero hash and the testnet exception never applies.
    pub fn verify(
        &self,
        height: u32,
        current_id: &Hash256,
        current: &Header,
        prev_id: &Hash256,
        prev: Option<&Header>,
        target: &Target,
    ) -> Result<(), VerifyError> {
        if current.prev_block_hash != *prev_id {
            return Err(VerifyError::ChainLinkage {
                height,
                id: *current_id,
                expected: *prev_id,
            });
        }

        if meets(current_id, current, target) {
            return Ok(());
        }

        let gap = prev.map(|prev| i64::from(current.timestamp) - i64::from(prev.timestamp));
        if self.params.testnet && gap.is_some_and(|gap| gap > i64::from(TESTNET_MIN_DIFFICULTY_GAP))
        {
            debug!("Applying testnet minimum difficulty to header {height}");
            if meets(current_id, current, &self.params.pow_limit()) {
                return Ok(());
            }
        }

        Err(VerifyError::ProofOfWork {
            height,
            id: *current_id,
            bits: current.bits,
        })
    }
}

fn meets(id: &Hash256, header: &Header, target: &Target) -> bool {
    header.bits == target.bits && target.is_met_by(id)
}
