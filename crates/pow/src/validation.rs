use cfsync_consensus::constants::MAX_FUTURE_BLOCK_TIME;
use cfsync_consensus::{ChainParams, Hash256};
use cfsync_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashAboveTarget,
    TimeTooNew { time: u32, limit: i64 },
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashAboveTarget => write!(f, "header hash does not meet its target"),
            PowError::TimeTooNew { time, limit } => {
                write!(f, "header time {time} is past the allowed limit {limit}")
            }
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Context-free header checks: the target is sane and within the chain's
/// limit, the hash meets it and the timestamp is not too far ahead of `now`.
/// Returns the header hash so callers don't hash twice.
pub fn check_header(
    header: &BlockHeader,
    params: &ChainParams,
    now: i64,
) -> Result<Hash256, PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("target is zero"));
    }
    if target > U256::from_little_endian(&params.pow_limit) {
        return Err(PowError::InvalidBits("target above chain limit"));
    }

    let hash = header.hash_with(params.wire.block_hash);
    if U256::from_little_endian(&hash) > target {
        return Err(PowError::HashAboveTarget);
    }

    let limit = now.saturating_add(MAX_FUTURE_BLOCK_TIME);
    if i64::from(header.time) > limit {
        return Err(PowError::TimeTooNew {
            time: header.time,
            limit,
        });
    }
    Ok(hash)
}
