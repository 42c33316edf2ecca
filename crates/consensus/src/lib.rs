//! Chain parameter tables and protocol constants.

pub mod constants;
pub mod params;

pub use params::{
    chain_params, hash256_from_hex, hash256_to_hex, BestChainRule, Chain, ChainParams, Checkpoint,
    DigestKind, FilterType, GenesisHeader, HexError, WireDialect,
};

/// 32-byte digest in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];
