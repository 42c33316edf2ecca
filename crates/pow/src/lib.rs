//! Compact targets, chain work and header proof-of-work checks.

pub mod difficulty;
pub mod validation;

pub use difficulty::{
    add_work, block_proof, compact_to_target, compact_to_u256, hash_meets_target,
    target_to_compact, u256_to_compact, work_from_bytes, work_to_bytes, CompactError, Work,
};
pub use validation::{check_header, PowError};
