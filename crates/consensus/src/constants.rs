//! Protocol-wide constants shared by every supported chain.

/// Protocol version advertised in our `version` message.
pub const PROTOCOL_VERSION: i32 = 70_015;
/// Lowest remote protocol version we keep a connection with.
pub const MIN_PEER_PROTO_VERSION: i32 = 70_002;
/// Remote versions from this point on understand `sendheaders`.
pub const SENDHEADERS_VERSION: i32 = 70_012;
/// Remote versions from this point on understand `feefilter`.
pub const FEEFILTER_VERSION: i32 = 70_013;

/// Headers whose timestamp is further than this in the future are rejected.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Most headers a single `headers` message may carry.
pub const MAX_HEADERS_RESULTS: usize = 2_000;
/// Most entries in a `getheaders`/`getblocks` locator.
pub const MAX_LOCATOR_SIZE: usize = 101;
/// Most entries in an `inv`/`getdata`/`notfound` message.
pub const MAX_INV_SIZE: usize = 50_000;
/// Most entries in an `addr` message.
pub const MAX_ADDR_TO_SEND: usize = 1_000;
/// Most filter hashes a single `cfheaders` message may carry.
pub const MAX_CFHEADERS_PER_MESSAGE: usize = 2_000;
/// Most filters a single `getcfilters` request may cover.
pub const MAX_GETCFILTERS_SIZE: usize = 1_000;
/// Spacing of the filter header checkpoints returned by `cfcheckpt`.
pub const CFCHECKPT_INTERVAL: i32 = 1_000;
