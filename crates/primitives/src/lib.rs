//! Header, filter-header and wire encoding primitives.

pub mod block;
pub mod encoding;
pub mod filter;
pub mod hash;

pub use block::{BlockHeader, Position, HEADER_SIZE};
pub use encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use filter::{filter_hash, next_filter_header, FilterHeaderChain};
pub use hash::{checksum, digest, sha256, sha256d};
