//! Compact target ("nBits") conversions and chain work arithmetic.

use cfsync_consensus::Hash256;
use primitive_types::U256;

/// Cumulative chain work, stored as 32 big-endian bytes.
pub type Work = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target is negative"),
            CompactError::Overflow => write!(f, "compact target does not fit in 256 bits"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if mantissa != 0 && bits & 0x0080_0000 != 0 {
        return Err(CompactError::Negative);
    }
    if exponent <= 3 {
        return Ok(U256::from(mantissa >> (8 * (3 - exponent))));
    }
    let significant_bytes = match mantissa {
        0 => return Ok(U256::zero()),
        0x1..=0xff => 1,
        0x100..=0xffff => 2,
        _ => 3,
    };
    if exponent - 3 + significant_bytes > 32 {
        return Err(CompactError::Overflow);
    }
    Ok(U256::from(mantissa) << (8 * (exponent - 3)))
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }
    let mut exponent = value.bits().div_ceil(8) as u32;
    let mut mantissa = if exponent <= 3 {
        value.low_u32() << (8 * (3 - exponent))
    } else {
        (value >> (8 * (exponent - 3))).low_u32()
    };
    // Keep the sign bit clear by moving one byte into the exponent.
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        exponent += 1;
    }
    (exponent << 24) | mantissa
}

/// Target as a little-endian hash, comparable with block hashes.
pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes to find a block at `bits`: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    // 2^256 does not fit; (!target / (target + 1)) + 1 is the same quotient.
    Ok((!target / (target + U256::one())) + U256::one())
}

pub fn work_to_bytes(work: U256) -> Work {
    work.to_big_endian()
}

pub fn work_from_bytes(bytes: &Work) -> U256 {
    U256::from_big_endian(bytes)
}

/// Parent work plus the proof of a header with `bits`. Saturates instead of wrapping.
pub fn add_work(parent: &Work, bits: u32) -> Result<Work, CompactError> {
    let total = work_from_bytes(parent).saturating_add(block_proof(bits)?);
    Ok(work_to_bytes(total))
}
