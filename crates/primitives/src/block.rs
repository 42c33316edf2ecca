//! Block headers and chain positions.

use cfsync_consensus::{hash256_from_hex, hash256_to_hex, DigestKind, GenesisHeader, Hash256};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::digest;

/// Serialized size of a header.
pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn genesis(genesis: &GenesisHeader) -> Self {
        // The chain table is static; a bad merkle root there is a build error.
        let merkle_root = match hash256_from_hex(genesis.merkle_root) {
            Ok(root) => root,
            Err(err) => panic!("genesis merkle root: {err}"),
        };
        Self {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_block);
        out[36..68].copy_from_slice(&self.merkle_root);
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    pub fn hash_with(&self, kind: DigestKind) -> Hash256 {
        digest(kind, &self.to_bytes())
    }

    pub fn hash(&self) -> Hash256 {
        self.hash_with(DigestKind::Sha256d)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block == [0u8; 32]
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.to_bytes());
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

/// A point in a header chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Position {
    pub height: i32,
    pub hash: Hash256,
}

impl Position {
    pub fn new(height: i32, hash: Hash256) -> Self {
        Self { height, hash }
    }

    /// Placeholder for "nothing yet", one below genesis.
    pub fn blank() -> Self {
        Self {
            height: -1,
            hash: [0u8; 32],
        }
    }

    pub fn is_blank(&self) -> bool {
        self.height < 0
    }

    pub fn to_bytes(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..4].copy_from_slice(&self.height.to_le_bytes());
        out[4..].copy_from_slice(&self.hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_i32_le()?;
        let hash = decoder.read_hash()?;
        decoder.finish()?;
        Ok(Self { height, hash })
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at height {}", hash256_to_hex(&self.hash), self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfsync_consensus::{chain_params, Chain};

    #[test]
    fn bitcoin_genesis_hash() {
        let params = chain_params(Chain::Bitcoin);
        let header = BlockHeader::genesis(&params.genesis);
        assert_eq!(
            hash256_to_hex(&header.hash()),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn header_layout_is_eighty_bytes() {
        let header = BlockHeader {
            version: 0x2000_0000,
            prev_block: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 0x0102_0304,
            bits: 0x1d00_ffff,
            nonce: 0xdead_beef,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x20]);
        assert_eq!(&bytes[4..36], &[0x11; 32]);
        assert_eq!(&bytes[68..72], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[76..80], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(BlockHeader::from_bytes(&bytes), Ok(header));
        assert_eq!(
            BlockHeader::from_bytes(&bytes[..79]),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn position_record() {
        let position = Position::new(42, [7u8; 32]);
        assert_eq!(Position::from_bytes(&position.to_bytes()), Ok(position));
        assert!(Position::blank().is_blank());
    }
}
