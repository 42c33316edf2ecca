//! Byte-level encoding used by the peer protocol and the on-disk records.
//!
//! Integers are little-endian, lengths and counts are compact-size, hashes
//! travel in internal byte order. `Decoder` never panics on short input; every
//! read reports `DecodeError::UnexpectedEof` instead.

use cfsync_consensus::Hash256;

/// Largest length prefix accepted for a single field.
pub const MAX_COMPACT_SIZE: u64 = 0x0200_0000;

#[derive(Default, Debug, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Ports in network addresses are the one big-endian field of the protocol.
    pub fn write_u16_be(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }

    pub fn write_compact_size(&mut self, value: u64) {
        match value {
            0..=0xfc => self.write_u8(value as u8),
            0xfd..=0xffff => {
                self.write_u8(0xfd);
                self.write_u16_le(value as u16);
            }
            0x1_0000..=0xffff_ffff => {
                self.write_u8(0xfe);
                self.write_u32_le(value as u32);
            }
            _ => {
                self.write_u8(0xff);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_compact_size(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    /// Writes a compact-size count followed by each item.
    pub fn write_list<T, F>(&mut self, items: &[T], mut write_item: F)
    where
        F: FnMut(&mut Self, &T),
    {
        self.write_compact_size(items.len() as u64);
        for item in items {
            write_item(self, item);
        }
    }

    pub fn write_hashes(&mut self, hashes: &[Hash256]) {
        self.write_list(hashes, |encoder, hash| encoder.write_hash(hash));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    NonCanonicalCompactSize,
    SizeTooLarge,
    TooManyItems { limit: usize, found: u64 },
    InvalidData(&'static str),
    TrailingBytes,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of input"),
            DecodeError::NonCanonicalCompactSize => write!(f, "non-canonical compact size"),
            DecodeError::SizeTooLarge => write!(f, "length prefix exceeds maximum"),
            DecodeError::TooManyItems { limit, found } => {
                write!(f, "list of {found} items exceeds limit {limit}")
            }
            DecodeError::InvalidData(message) => write!(f, "{message}"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after decode"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Fails with `TrailingBytes` unless all input was consumed.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.input[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    /// Consumes everything left.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let slice = &self.input[self.cursor..];
        self.cursor = self.input.len();
        slice
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidData("boolean byte must be 0 or 1")),
        }
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        self.read_array().map(u16::from_be_bytes)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        self.read_array().map(i64::from_le_bytes)
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.read_array()
    }

    pub fn read_compact_size(&mut self) -> Result<u64, DecodeError> {
        let (value, minimum) = match self.read_u8()? {
            0xfd => (u64::from(self.read_u16_le()?), 0xfd),
            0xfe => (u64::from(self.read_u32_le()?), 0x1_0000),
            0xff => (self.read_u64_le()?, 0x1_0000_0000),
            small => return Ok(u64::from(small)),
        };
        if value < minimum {
            return Err(DecodeError::NonCanonicalCompactSize);
        }
        Ok(value)
    }

    /// Reads a compact-size element count and checks it against `limit` and
    /// against the bytes left (each element needs at least `min_item_size`).
    pub fn read_count(&mut self, limit: usize, min_item_size: usize) -> Result<usize, DecodeError> {
        let found = self.read_compact_size()?;
        if found > limit as u64 {
            return Err(DecodeError::TooManyItems { limit, found });
        }
        let count = found as usize;
        if count.saturating_mul(min_item_size) > self.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        Ok(count)
    }

    pub fn read_list<T, F>(
        &mut self,
        limit: usize,
        min_item_size: usize,
        mut read_item: F,
    ) -> Result<Vec<T>, DecodeError>
    where
        F: FnMut(&mut Self) -> Result<T, DecodeError>,
    {
        let count = self.read_count(limit, min_item_size)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(read_item(self)?);
        }
        Ok(items)
    }

    pub fn read_hashes(&mut self, limit: usize) -> Result<Vec<Hash256>, DecodeError> {
        self.read_list(limit, 32, |decoder| decoder.read_hash())
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_compact_size()?;
        if len > MAX_COMPACT_SIZE {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.read_var_bytes()?)
            .map_err(|_| DecodeError::InvalidData("string is not utf-8"))
    }
}

pub trait Encodable {
    fn consensus_encode(&self, encoder: &mut Encoder);
}

pub trait Decodable: Sized {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError>;
}

pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.consensus_encode(&mut encoder);
    encoder.into_inner()
}

/// Decodes exactly one value; leftover input is an error.
pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::consensus_decode(&mut decoder)?;
    decoder.finish()?;
    Ok(value)
}
