use std::fmt;

use cfsync_consensus::{hash256_to_hex, FilterType, Hash256};
use cfsync_primitives::DecodeError;
use cfsync_storage::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// No header with this hash is stored.
    NotFound(Hash256),
    /// The best chain has no block at this height.
    HeightNotFound(i32),
    CheckpointConflict { height: i32 },
    Store(StoreError),
    /// Persistent state that should always exist is missing or undecodable.
    Corrupt(String),
    /// A thread panicked while holding the named lock.
    Poisoned(&'static str),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::NotFound(hash) => write!(f, "header {} not found", hash256_to_hex(hash)),
            HeaderError::HeightNotFound(height) => {
                write!(f, "no best chain block at height {height}")
            }
            HeaderError::CheckpointConflict { height } => {
                write!(f, "checkpoint at height {height} conflicts with the best chain")
            }
            HeaderError::Store(err) => write!(f, "{err}"),
            HeaderError::Corrupt(message) => write!(f, "corrupt header index: {message}"),
            HeaderError::Poisoned(lock) => write!(f, "{lock} lock poisoned"),
        }
    }
}

impl std::error::Error for HeaderError {}

impl From<StoreError> for HeaderError {
    fn from(err: StoreError) -> Self {
        HeaderError::Store(err)
    }
}

impl From<DecodeError> for HeaderError {
    fn from(err: DecodeError) -> Self {
        HeaderError::Corrupt(err.to_string())
    }
}

impl HeaderError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HeaderError::NotFound(_) | HeaderError::HeightNotFound(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    NotFound {
        filter_type: FilterType,
        block: Hash256,
    },
    /// `cfheaders` does not chain onto what we already have.
    InvalidChain {
        filter_type: FilterType,
        height: i32,
        reason: &'static str,
    },
    /// A filter whose hash differs from the one committed by its filter header.
    InvalidFilter {
        filter_type: FilterType,
        block: Hash256,
    },
    /// A filter arrived before the filter header it must match.
    MissingFilterHeader {
        filter_type: FilterType,
        block: Hash256,
    },
    /// The stop hash of a response is not on our best chain.
    UnknownBlock(Hash256),
    Header(HeaderError),
    Store(StoreError),
    Corrupt(String),
    Poisoned(&'static str),
    /// The filter oracle task has shut down.
    Stopped,
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::NotFound { filter_type, block } => write!(
                f,
                "no {filter_type} filter data for block {}",
                hash256_to_hex(block)
            ),
            FilterError::InvalidChain {
                filter_type,
                height,
                reason,
            } => write!(
                f,
                "invalid {filter_type} filter header chain at height {height}: {reason}"
            ),
            FilterError::InvalidFilter { filter_type, block } => write!(
                f,
                "{filter_type} filter for block {} does not match its filter header",
                hash256_to_hex(block)
            ),
            FilterError::MissingFilterHeader { filter_type, block } => write!(
                f,
                "no {filter_type} filter header for block {}",
                hash256_to_hex(block)
            ),
            FilterError::UnknownBlock(hash) => {
                write!(f, "block {} is not on the best chain", hash256_to_hex(hash))
            }
            FilterError::Header(err) => write!(f, "{err}"),
            FilterError::Store(err) => write!(f, "{err}"),
            FilterError::Corrupt(message) => write!(f, "corrupt filter index: {message}"),
            FilterError::Poisoned(lock) => write!(f, "{lock} lock poisoned"),
            FilterError::Stopped => write!(f, "filter oracle stopped"),
        }
    }
}

impl std::error::Error for FilterError {}

impl FilterError {
    /// Errors caused by what a peer sent us, as opposed to local failures.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FilterError::InvalidChain { .. } | FilterError::InvalidFilter { .. }
        )
    }
}

impl From<StoreError> for FilterError {
    fn from(err: StoreError) -> Self {
        FilterError::Store(err)
    }
}

impl From<HeaderError> for FilterError {
    fn from(err: HeaderError) -> Self {
        FilterError::Header(err)
    }
}

impl From<DecodeError> for FilterError {
    fn from(err: DecodeError) -> Self {
        FilterError::Corrupt(err.to_string())
    }
}
