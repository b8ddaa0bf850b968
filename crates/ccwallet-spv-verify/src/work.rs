//! Proof-of-work targets: compact encoding and difficulty retargeting.

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use crate::hash::Hash256;
use crate::header::Header;

/// Expected duration of one retarget period (two weeks)
pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;

/// Compact encoding of the mainnet/testnet proof-of-work limit
pub const MAX_BITS: u32 = 0x1d00ffff;

/// Block gap after which testnet accepts a minimum-difficulty block
pub const TESTNET_MIN_DIFFICULTY_GAP: u32 = 20 * 60;

/// Proof-of-work target in both compact and expanded form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Compact ("nBits") encoding
    pub bits: u32,
    /// 256-bit target, big-endian
    pub target: [u8; 32],
}

impl Target {
    /// Expand a compact encoding
    pub fn from_bits(bits: u32) -> Self {
        Self {
            bits,
            target: to_be_bytes32(&compact_to_target(bits)),
        }
    }

    /// Build from an expanded value; `bits` is the normalized compact encoding of it
    pub fn from_value(value: &BigUint) -> Self {
        Self {
            bits: target_to_compact(value),
            target: to_be_bytes32(value),
        }
    }

    pub fn value(&self) -> BigUint {
        BigUint::from_bytes_be(&self.target)
    }

    /// Whether a block id, read as a 256-bit big-endian integer, is strictly below the target
    pub fn is_met_by(&self, id: &Hash256) -> bool {
        id.as_bytes() < &self.target
    }
}

/// Decode compact bits into a target value.
///
/// The high byte is the size of the value in bytes, the low three bytes are the
/// mantissa. The sign bit (0x00800000) is masked off since targets are unsigned.
pub fn compact_to_target(bits: u32) -> BigUint {
    let size = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if size <= 3 {
        BigUint::from(mantissa >> (8 * (3 - size)))
    } else {
        BigUint::from(mantissa) << (8 * (size - 3))
    }
}

/// Encode a target value into normalized compact bits (mantissa at most 0x7fffff).
pub fn target_to_compact(value: &BigUint) -> u32 {
    if value.is_zero() {
        return 0;
    }
    let bytes = value.to_bytes_be();
    let mut size = bytes.len() as u32;
    let mut compact = bytes
        .iter()
        .take(3)
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));
    if size < 3 {
        compact <<= 8 * (3 - size);
    }
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

fn to_be_bytes32(value: &BigUint) -> [u8; 32] {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return [0xff; 32];
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Consensus parameters relevant to header verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    /// Compact encoding of the easiest allowed target
    pub pow_limit_bits: u32,
    /// Enables the testnet minimum-difficulty exception
    pub testnet: bool,
}

impl ChainParams {
    pub const fn mainnet() -> Self {
        Self {
            pow_limit_bits: MAX_BITS,
            testnet: false,
        }
    }

    pub const fn testnet() -> Self {
        Self {
            pow_limit_bits: MAX_BITS,
            testnet: true,
        }
    }

    /// Parameters with a custom proof-of-work limit, e.g. `0x207fffff` for regtest-style chains
    pub const fn with_pow_limit(pow_limit_bits: u32, testnet: bool) -> Self {
        Self {
            pow_limit_bits,
            testnet,
        }
    }

    /// Easiest allowed target; also the expected target of the first retarget period
    pub fn pow_limit(&self) -> Target {
        Target::from_bits(self.pow_limit_bits)
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}

/// Compute the target of a retarget period from the first and the last header
/// of the previous period.
pub fn retarget(first: &Header, last: &Header, params: &ChainParams) -> Target {
    let timespan = i64::from(TARGET_TIMESPAN);
    let actual_timespan = (i64::from(last.timestamp) - i64::from(first.timestamp))
        .clamp(timespan / 4, timespan * 4);

    // Clamped span is always positive
    let target = compact_to_target(last.bits) * BigUint::from(actual_timespan as u64)
        / BigUint::from(TARGET_TIMESPAN);
    let limit = params.pow_limit().value();

    Target::from_value(&target.min(limit))
}
