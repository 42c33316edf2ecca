//! Header chain and compact filter state.
//!
//! [`HeaderStore`] and [`FilterStore`] persist the header index and filter
//! tables on top of a `KeyValueStore`. [`HeaderOracle`] applies header batches
//! (orphans, forks, reorgs) and [`FilterOracle`] validates filter headers and
//! filters and decides what to download next.

pub mod error;
pub mod events;
pub mod filter_oracle;
pub mod filter_store;
pub mod header_oracle;
pub mod header_store;
pub mod update;

pub use error::{FilterError, HeaderError};
pub use events::{ChainEvent, ChainEvents, Reorg};
pub use filter_oracle::{
    FilterConfig, FilterHeadersOutcome, FilterOracle, FilterOracleHandle, FilterRequest,
    FilterSync,
};
pub use filter_store::{FilterHeaderRecord, FilterStore};
pub use header_oracle::{AddHeadersOutcome, HeaderOracle, OracleConfig, TieBreak};
pub use header_store::{HeaderStore, StoredHeader};
pub use update::{ChainSegment, DisconnectedList, OrphanHeader, UpdateTransaction};

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
