//! Typed peer messages and their payload layouts.
//!
//! Hashes travel in internal byte order, integers little-endian, ports
//! big-endian. Bulk data this client never interprets (blocks, transactions)
//! is kept as raw bytes.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use cfsync_consensus::constants::{
    MAX_ADDR_TO_SEND, MAX_CFHEADERS_PER_MESSAGE, MAX_HEADERS_RESULTS, MAX_INV_SIZE,
    MAX_LOCATOR_SIZE,
};
use cfsync_consensus::{ChainParams, Hash256, WireDialect};
use cfsync_primitives::{BlockHeader, DecodeError, Decoder, Encoder, HEADER_SIZE};

use crate::wire::{encode_frame, Command, RawMessage, WireError};

/// Service bits advertised in `version` and `addr`.
pub mod services {
    pub const NETWORK: u64 = 1;
    pub const BLOOM: u64 = 1 << 2;
    pub const WITNESS: u64 = 1 << 3;
    pub const COMPACT_FILTERS: u64 = 1 << 6;
    pub const NETWORK_LIMITED: u64 = 1 << 10;
}

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;
pub const MSG_CMPCT_BLOCK: u32 = 4;
pub const MSG_WITNESS_FLAG: u32 = 1 << 30;
pub const MSG_WITNESS_BLOCK: u32 = MSG_BLOCK | MSG_WITNESS_FLAG;
pub const MSG_WITNESS_TX: u32 = MSG_TX | MSG_WITNESS_FLAG;

const NET_ADDR_SIZE: usize = 26;
const MAX_CFCHECKPT_HEADERS: usize = 50_000;
const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
const MAX_FILTERADD_SIZE: usize = 520;
const MAX_BLOCKTXN_INDEXES: usize = 100_000;
const MAX_MERKLE_HASHES: usize = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn from_socket(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip4) => ip4.to_ipv6_mapped().octets(),
            IpAddr::V6(ip6) => ip6.octets(),
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn unroutable() -> Self {
        Self {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let ip6 = Ipv6Addr::from(self.ip);
        let ip = match ip6.to_ipv4_mapped() {
            Some(ip4) => IpAddr::V4(ip4),
            None => IpAddr::V6(ip6),
        };
        SocketAddr::new(ip, self.port)
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip);
        encoder.write_u16_be(self.port);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            services: decoder.read_u64_le()?,
            ip: decoder.read_array()?,
            port: decoder.read_u16_be()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampedAddress {
    pub time: u32,
    pub address: NetAddress,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockLocator {
    pub version: u32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

/// `getcfheaders` and `getcfilters` share one layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterRange {
    pub filter_type: u8,
    pub start_height: u32,
    pub stop_hash: Hash256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterCheckpointRequest {
    pub filter_type: u8,
    pub stop_hash: Hash256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfHeaders {
    pub filter_type: u8,
    pub stop_hash: Hash256,
    pub previous_header: Hash256,
    pub filter_hashes: Vec<Hash256>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CFilter {
    pub filter_type: u8,
    pub block_hash: Hash256,
    pub filter: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfCheckpt {
    pub filter_type: u8,
    pub stop_hash: Hash256,
    pub headers: Vec<Hash256>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inventory {
    pub kind: u32,
    pub hash: Hash256,
}

impl Inventory {
    pub fn is_block(&self) -> bool {
        self.kind == MSG_BLOCK || self.kind == MSG_WITNESS_BLOCK
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Option<Hash256>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterLoad {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

/// Absolute transaction indexes; differential encoding is a wire detail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTxnRequest {
    pub block_hash: Hash256,
    pub indexes: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTxn {
    pub block_hash: Hash256,
    /// Count-prefixed serialized transactions.
    pub transactions: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactBlock {
    pub header: BlockHeader,
    pub nonce: u64,
    pub short_ids: Vec<[u8; 6]>,
    /// Count-prefixed prefilled transactions.
    pub prefilled: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Getaddr,
    Addr(Vec<TimestampedAddress>),
    Getheaders(BlockLocator),
    Getblocks(BlockLocator),
    Headers(Vec<BlockHeader>),
    Getcfheaders(FilterRange),
    Cfheaders(CfHeaders),
    Getcfilters(FilterRange),
    Cfilter(CFilter),
    Getcfcheckpt(FilterCheckpointRequest),
    Cfcheckpt(CfCheckpt),
    Inv(Vec<Inventory>),
    Getdata(Vec<Inventory>),
    Notfound(Vec<Inventory>),
    Block(Vec<u8>),
    Tx(Vec<u8>),
    Reject(RejectMessage),
    Sendcmpct { announce: bool, version: u64 },
    Sendheaders,
    Feefilter(i64),
    Mempool,
    Filterload(FilterLoad),
    Filteradd(Vec<u8>),
    Filterclear,
    Getblocktxn(BlockTxnRequest),
    Blocktxn(BlockTxn),
    Merkleblock(MerkleBlock),
    Cmpctblock(CompactBlock),
    /// A well-formed command this client does not speak.
    Unsupported { command: String, payload: Vec<u8> },
}

impl Message {
    /// `None` only for [`Message::Unsupported`].
    pub fn command(&self) -> Option<Command> {
        let command = match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::Getaddr => Command::Getaddr,
            Message::Addr(_) => Command::Addr,
            Message::Getheaders(_) => Command::Getheaders,
            Message::Getblocks(_) => Command::Getblocks,
            Message::Headers(_) => Command::Headers,
            Message::Getcfheaders(_) => Command::Getcfheaders,
            Message::Cfheaders(_) => Command::Cfheaders,
            Message::Getcfilters(_) => Command::Getcfilters,
            Message::Cfilter(_) => Command::Cfilter,
            Message::Getcfcheckpt(_) => Command::Getcfcheckpt,
            Message::Cfcheckpt(_) => Command::Cfcheckpt,
            Message::Inv(_) => Command::Inv,
            Message::Getdata(_) => Command::Getdata,
            Message::Notfound(_) => Command::Notfound,
            Message::Block(_) => Command::Block,
            Message::Tx(_) => Command::Tx,
            Message::Reject(_) => Command::Reject,
            Message::Sendcmpct { .. } => Command::Sendcmpct,
            Message::Sendheaders => Command::Sendheaders,
            Message::Feefilter(_) => Command::Feefilter,
            Message::Mempool => Command::Mempool,
            Message::Filterload(_) => Command::Filterload,
            Message::Filteradd(_) => Command::Filteradd,
            Message::Filterclear => Command::Filterclear,
            Message::Getblocktxn(_) => Command::Getblocktxn,
            Message::Blocktxn(_) => Command::Blocktxn,
            Message::Merkleblock(_) => Command::Merkleblock,
            Message::Cmpctblock(_) => Command::Cmpctblock,
            Message::Unsupported { .. } => return None,
        };
        Some(command)
    }

    pub fn name(&self) -> &str {
        match self {
            Message::Unsupported { command, .. } => command,
            other => other.command().map(Command::as_str).unwrap_or("unknown"),
        }
    }

    pub fn encode_payload(&self, dialect: &WireDialect) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Message::Version(version) => encode_version(&mut encoder, version),
            Message::Verack
            | Message::Getaddr
            | Message::Sendheaders
            | Message::Mempool
            | Message::Filterclear => {}
            Message::Ping(nonce) | Message::Pong(nonce) => encoder.write_u64_le(*nonce),
            Message::Addr(entries) => {
                encoder.write_list(entries, |encoder, entry| {
                    encoder.write_u32_le(entry.time);
                    entry.address.encode(encoder);
                });
            }
            Message::Getheaders(locator) | Message::Getblocks(locator) => {
                encoder.write_u32_le(locator.version);
                encoder.write_hashes(&locator.locator);
                encoder.write_hash(&locator.stop);
            }
            Message::Headers(headers) => {
                encoder.write_list(headers, |encoder, header| {
                    encoder.write_bytes(&header.to_bytes());
                    if dialect.header_tx_count {
                        encoder.write_compact_size(0);
                    }
                });
            }
            Message::Getcfheaders(range) | Message::Getcfilters(range) => {
                encoder.write_u8(range.filter_type);
                encoder.write_u32_le(range.start_height);
                encoder.write_hash(&range.stop_hash);
            }
            Message::Cfheaders(cfheaders) => {
                encoder.write_u8(cfheaders.filter_type);
                encoder.write_hash(&cfheaders.stop_hash);
                encoder.write_hash(&cfheaders.previous_header);
                encoder.write_hashes(&cfheaders.filter_hashes);
            }
            Message::Cfilter(cfilter) => {
                encoder.write_u8(cfilter.filter_type);
                encoder.write_hash(&cfilter.block_hash);
                encoder.write_var_bytes(&cfilter.filter);
            }
            Message::Getcfcheckpt(request) => {
                encoder.write_u8(request.filter_type);
                encoder.write_hash(&request.stop_hash);
            }
            Message::Cfcheckpt(checkpoint) => {
                encoder.write_u8(checkpoint.filter_type);
                encoder.write_hash(&checkpoint.stop_hash);
                encoder.write_hashes(&checkpoint.headers);
            }
            Message::Inv(items) | Message::Getdata(items) | Message::Notfound(items) => {
                encoder.write_list(items, |encoder, item| {
                    encoder.write_u32_le(item.kind);
                    encoder.write_hash(&item.hash);
                });
            }
            Message::Block(bytes) | Message::Tx(bytes) => encoder.write_bytes(bytes),
            Message::Reject(reject) => {
                encoder.write_var_str(&reject.message);
                encoder.write_u8(reject.code);
                encoder.write_var_str(&reject.reason);
                if let Some(data) = &reject.data {
                    encoder.write_hash(data);
                }
            }
            Message::Sendcmpct { announce, version } => {
                encoder.write_bool(*announce);
                encoder.write_u64_le(*version);
            }
            Message::Feefilter(rate) => encoder.write_i64_le(*rate),
            Message::Filterload(load) => {
                encoder.write_var_bytes(&load.filter);
                encoder.write_u32_le(load.hash_funcs);
                encoder.write_u32_le(load.tweak);
                encoder.write_u8(load.flags);
            }
            Message::Filteradd(data) => encoder.write_var_bytes(data),
            Message::Getblocktxn(request) => {
                encoder.write_hash(&request.block_hash);
                encoder.write_compact_size(request.indexes.len() as u64);
                let mut next = 0u64;
                for index in &request.indexes {
                    encoder.write_compact_size(index.saturating_sub(next));
                    next = index.saturating_add(1);
                }
            }
            Message::Blocktxn(txn) => {
                encoder.write_hash(&txn.block_hash);
                encoder.write_bytes(&txn.transactions);
            }
            Message::Merkleblock(block) => {
                encoder.write_bytes(&block.header.to_bytes());
                encoder.write_u32_le(block.total_transactions);
                encoder.write_hashes(&block.hashes);
                encoder.write_var_bytes(&block.flags);
            }
            Message::Cmpctblock(block) => {
                encoder.write_bytes(&block.header.to_bytes());
                encoder.write_u64_le(block.nonce);
                encoder.write_list(&block.short_ids, |encoder, id| encoder.write_bytes(id));
                encoder.write_bytes(&block.prefilled);
            }
            Message::Unsupported { payload, .. } => encoder.write_bytes(payload),
        }
        encoder.into_inner()
    }

    /// Full frame ready for the socket.
    pub fn to_frame(&self, params: &ChainParams) -> Result<Vec<u8>, WireError> {
        let payload = self.encode_payload(&params.wire);
        match self.command() {
            Some(command) => encode_frame(params, command, &payload),
            None => Err(WireError::BadCommand),
        }
    }

    /// Decodes a verified frame. Unknown command names become
    /// [`Message::Unsupported`]; a known command with a bad payload is an error.
    pub fn decode(dialect: &WireDialect, raw: &RawMessage) -> Result<Message, WireError> {
        let Some(command) = raw.header.command()? else {
            return Ok(Message::Unsupported {
                command: raw.header.command_name()?.to_string(),
                payload: raw.payload.clone(),
            });
        };
        decode_payload(dialect, command, &raw.payload)
            .map_err(|error| WireError::Malformed { command, error })
    }
}

fn encode_version(encoder: &mut Encoder, version: &VersionMessage) {
    encoder.write_i32_le(version.version);
    encoder.write_u64_le(version.services);
    encoder.write_i64_le(version.timestamp);
    version.receiver.encode(encoder);
    version.sender.encode(encoder);
    encoder.write_u64_le(version.nonce);
    encoder.write_var_str(&version.user_agent);
    encoder.write_i32_le(version.start_height);
    encoder.write_bool(version.relay);
}

fn decode_version(decoder: &mut Decoder) -> Result<VersionMessage, DecodeError> {
    let version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let timestamp = decoder.read_i64_le()?;
    let receiver = NetAddress::decode(decoder)?;
    let sender = NetAddress::decode(decoder)?;
    let nonce = decoder.read_u64_le()?;
    let user_agent = decoder.read_var_str()?;
    let start_height = decoder.read_i32_le()?;
    // Pre-BIP37 peers omit the relay flag.
    let relay = if decoder.is_empty() {
        true
    } else {
        decoder.read_u8()? != 0
    };
    Ok(VersionMessage {
        version,
        services,
        timestamp,
        receiver,
        sender,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

fn decode_locator(decoder: &mut Decoder) -> Result<BlockLocator, DecodeError> {
    Ok(BlockLocator {
        version: decoder.read_u32_le()?,
        locator: decoder.read_hashes(MAX_LOCATOR_SIZE)?,
        stop: decoder.read_hash()?,
    })
}

fn decode_headers(dialect: &WireDialect, decoder: &mut Decoder) -> Result<Vec<BlockHeader>, DecodeError> {
    let entry_size = HEADER_SIZE + usize::from(dialect.header_tx_count);
    decoder.read_list(MAX_HEADERS_RESULTS, entry_size, |decoder| {
        let header = BlockHeader::from_bytes(decoder.take(HEADER_SIZE)?)?;
        if dialect.header_tx_count && decoder.read_compact_size()? != 0 {
            return Err(DecodeError::InvalidData("headers entry carries transactions"));
        }
        Ok(header)
    })
}

fn decode_range(decoder: &mut Decoder) -> Result<FilterRange, DecodeError> {
    Ok(FilterRange {
        filter_type: decoder.read_u8()?,
        start_height: decoder.read_u32_le()?,
        stop_hash: decoder.read_hash()?,
    })
}

fn decode_inventory(decoder: &mut Decoder) -> Result<Vec<Inventory>, DecodeError> {
    decoder.read_list(MAX_INV_SIZE, 36, |decoder| {
        Ok(Inventory {
            kind: decoder.read_u32_le()?,
            hash: decoder.read_hash()?,
        })
    })
}

fn decode_reject(decoder: &mut Decoder) -> Result<RejectMessage, DecodeError> {
    let message = decoder.read_var_str()?;
    let code = decoder.read_u8()?;
    let reason = decoder.read_var_str()?;
    // Only block and tx rejects carry a hash; anything else is ignored.
    let data = if decoder.remaining() == 32 {
        Some(decoder.read_hash()?)
    } else {
        decoder.take_rest();
        None
    };
    Ok(RejectMessage {
        message,
        code,
        reason,
        data,
    })
}

fn decode_blocktxn_request(decoder: &mut Decoder) -> Result<BlockTxnRequest, DecodeError> {
    let block_hash = decoder.read_hash()?;
    let count = decoder.read_count(MAX_BLOCKTXN_INDEXES, 1)?;
    let mut indexes = Vec::with_capacity(count);
    let mut next = 0u64;
    for _ in 0..count {
        let index = next
            .checked_add(decoder.read_compact_size()?)
            .ok_or(DecodeError::InvalidData("transaction index overflow"))?;
        indexes.push(index);
        next = index
            .checked_add(1)
            .ok_or(DecodeError::InvalidData("transaction index overflow"))?;
    }
    Ok(BlockTxnRequest {
        block_hash,
        indexes,
    })
}

fn decode_payload(
    dialect: &WireDialect,
    command: Command,
    payload: &[u8],
) -> Result<Message, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let decoder = &mut decoder;
    let message = match command {
        Command::Version => Message::Version(decode_version(decoder)?),
        Command::Verack => Message::Verack,
        Command::Ping => Message::Ping(decoder.read_u64_le()?),
        Command::Pong => Message::Pong(decoder.read_u64_le()?),
        Command::Getaddr => Message::Getaddr,
        Command::Addr => Message::Addr(decoder.read_list(
            MAX_ADDR_TO_SEND,
            4 + NET_ADDR_SIZE,
            |decoder| {
                Ok(TimestampedAddress {
                    time: decoder.read_u32_le()?,
                    address: NetAddress::decode(decoder)?,
                })
            },
        )?),
        Command::Getheaders => Message::Getheaders(decode_locator(decoder)?),
        Command::Getblocks => Message::Getblocks(decode_locator(decoder)?),
        Command::Headers => Message::Headers(decode_headers(dialect, decoder)?),
        Command::Getcfheaders => Message::Getcfheaders(decode_range(decoder)?),
        Command::Getcfilters => Message::Getcfilters(decode_range(decoder)?),
        Command::Cfheaders => Message::Cfheaders(CfHeaders {
            filter_type: decoder.read_u8()?,
            stop_hash: decoder.read_hash()?,
            previous_header: decoder.read_hash()?,
            filter_hashes: decoder.read_hashes(MAX_CFHEADERS_PER_MESSAGE)?,
        }),
        Command::Cfilter => Message::Cfilter(CFilter {
            filter_type: decoder.read_u8()?,
            block_hash: decoder.read_hash()?,
            filter: decoder.read_var_bytes()?,
        }),
        Command::Getcfcheckpt => Message::Getcfcheckpt(FilterCheckpointRequest {
            filter_type: decoder.read_u8()?,
            stop_hash: decoder.read_hash()?,
        }),
        Command::Cfcheckpt => Message::Cfcheckpt(CfCheckpt {
            filter_type: decoder.read_u8()?,
            stop_hash: decoder.read_hash()?,
            headers: decoder.read_hashes(MAX_CFCHECKPT_HEADERS)?,
        }),
        Command::Inv => Message::Inv(decode_inventory(decoder)?),
        Command::Getdata => Message::Getdata(decode_inventory(decoder)?),
        Command::Notfound => Message::Notfound(decode_inventory(decoder)?),
        Command::Block => Message::Block(decoder.take_rest().to_vec()),
        Command::Tx => Message::Tx(decoder.take_rest().to_vec()),
        Command::Reject => Message::Reject(decode_reject(decoder)?),
        Command::Sendcmpct => Message::Sendcmpct {
            announce: decoder.read_bool()?,
            version: decoder.read_u64_le()?,
        },
        Command::Sendheaders => Message::Sendheaders,
        Command::Feefilter => Message::Feefilter(decoder.read_i64_le()?),
        Command::Mempool => Message::Mempool,
        Command::Filterload => {
            let filter = decoder.read_var_bytes()?;
            if filter.len() > MAX_BLOOM_FILTER_SIZE {
                return Err(DecodeError::SizeTooLarge);
            }
            Message::Filterload(FilterLoad {
                filter,
                hash_funcs: decoder.read_u32_le()?,
                tweak: decoder.read_u32_le()?,
                flags: decoder.read_u8()?,
            })
        }
        Command::Filteradd => {
            let data = decoder.read_var_bytes()?;
            if data.len() > MAX_FILTERADD_SIZE {
                return Err(DecodeError::SizeTooLarge);
            }
            Message::Filteradd(data)
        }
        Command::Filterclear => Message::Filterclear,
        Command::Getblocktxn => Message::Getblocktxn(decode_blocktxn_request(decoder)?),
        Command::Blocktxn => Message::Blocktxn(BlockTxn {
            block_hash: decoder.read_hash()?,
            transactions: decoder.take_rest().to_vec(),
        }),
        Command::Merkleblock => Message::Merkleblock(MerkleBlock {
            header: BlockHeader::from_bytes(decoder.take(HEADER_SIZE)?)?,
            total_transactions: decoder.read_u32_le()?,
            hashes: decoder.read_hashes(MAX_MERKLE_HASHES)?,
            flags: decoder.read_var_bytes()?,
        }),
        Command::Cmpctblock => Message::Cmpctblock(CompactBlock {
            header: BlockHeader::from_bytes(decoder.take(HEADER_SIZE)?)?,
            nonce: decoder.read_u64_le()?,
            short_ids: decoder.read_list(MAX_BLOCKTXN_INDEXES, 6, |decoder| decoder.read_array())?,
            prefilled: decoder.take_rest().to_vec(),
        }),
    };
    decoder.finish()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_frame;
    use cfsync_consensus::{chain_params, Chain};

    fn through_wire(message: &Message) -> Message {
        let params = chain_params(Chain::Bitcoin);
        let frame = message.to_frame(&params).expect("frame");
        let (raw, _) = decode_frame(&params, &frame).expect("frame decodes");
        Message::decode(&params.wire, &raw).expect("payload decodes")
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: [3u8; 32],
            merkle_root: [4u8; 32],
            time: 1_600_000_000,
            bits: 0x1d00_ffff,
            nonce: 42,
        }
    }

    #[test]
    fn version_layout_and_fields() {
        let version = VersionMessage {
            version: 70_015,
            services: services::NETWORK | services::COMPACT_FILTERS,
            timestamp: 1_700_000_000,
            receiver: NetAddress::from_socket("10.0.0.1:8333".parse().expect("addr"), 1),
            sender: NetAddress::unroutable(),
            nonce: 0x1234_5678_9abc_def0,
            user_agent: "/cfsync:0.1.0/".to_string(),
            start_height: 800_000,
            relay: false,
        };
        let payload = Message::Version(version.clone())
            .encode_payload(&chain_params(Chain::Bitcoin).wire);
        // 4 + 8 + 8 + 26 + 26 + 8 + (1 + 14) + 4 + 1
        assert_eq!(payload.len(), 100);
        assert_eq!(&payload[..4], &70_015i32.to_le_bytes());
        assert_eq!(&payload[20 + 24..20 + 26], &8333u16.to_be_bytes());
        assert_eq!(through_wire(&Message::Version(version.clone())), Message::Version(version));
    }

    #[test]
    fn version_without_relay_flag_defaults_to_relay() {
        let dialect = chain_params(Chain::Bitcoin).wire;
        let mut payload = Message::Version(VersionMessage {
            version: 70_001,
            services: services::NETWORK,
            timestamp: 0,
            receiver: NetAddress::unroutable(),
            sender: NetAddress::unroutable(),
            nonce: 1,
            user_agent: String::new(),
            start_height: 5,
            relay: false,
        })
        .encode_payload(&dialect);
        payload.pop();
        match decode_payload(&dialect, Command::Version, &payload) {
            Ok(Message::Version(version)) => {
                assert!(version.relay);
                assert_eq!(version.start_height, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn headers_follow_dialect_tx_count() {
        let mut dialect = chain_params(Chain::Bitcoin).wire;
        let message = Message::Headers(vec![sample_header(), sample_header()]);
        let payload = message.encode_payload(&dialect);
        assert_eq!(payload.len(), 1 + 2 * 81);
        assert_eq!(payload[81], 0);

        let mut with_txs = payload.clone();
        with_txs[81] = 1;
        assert!(decode_payload(&dialect, Command::Headers, &with_txs).is_err());

        dialect.header_tx_count = false;
        let bare = message.encode_payload(&dialect);
        assert_eq!(bare.len(), 1 + 2 * 80);
        assert_eq!(decode_payload(&dialect, Command::Headers, &bare), Ok(message));
    }

    #[test]
    fn filter_messages_round_trip() {
        let cfheaders = Message::Cfheaders(CfHeaders {
            filter_type: 0,
            stop_hash: [1u8; 32],
            previous_header: [2u8; 32],
            filter_hashes: vec![[5u8; 32], [6u8; 32]],
        });
        assert_eq!(through_wire(&cfheaders), cfheaders);

        let cfilter = Message::Cfilter(CFilter {
            filter_type: 0,
            block_hash: [7u8; 32],
            filter: vec![1, 2, 3],
        });
        assert_eq!(through_wire(&cfilter), cfilter);

        let range = Message::Getcfilters(FilterRange {
            filter_type: 0,
            start_height: 1_000,
            stop_hash: [8u8; 32],
        });
        let payload = range.encode_payload(&chain_params(Chain::Bitcoin).wire);
        assert_eq!(payload.len(), 37);
        assert_eq!(through_wire(&range), range);
    }

    #[test]
    fn getblocktxn_indexes_are_differential() {
        let message = Message::Getblocktxn(BlockTxnRequest {
            block_hash: [9u8; 32],
            indexes: vec![0, 1, 5, 300],
        });
        let payload = message.encode_payload(&chain_params(Chain::Bitcoin).wire);
        assert_eq!(&payload[32..], &[4, 0, 0, 3, 0xfd, 0x26, 0x01]);
        assert_eq!(through_wire(&message), message);
    }

    #[test]
    fn getblocktxn_encoding_saturates_at_the_last_index() {
        let message = Message::Getblocktxn(BlockTxnRequest {
            block_hash: [9u8; 32],
            indexes: vec![3, u64::MAX],
        });
        let payload = message.encode_payload(&chain_params(Chain::Bitcoin).wire);
        let mut expected = vec![2, 3, 0xff];
        expected.extend_from_slice(&(u64::MAX - 4).to_le_bytes());
        assert_eq!(&payload[32..], expected.as_slice());
    }

    #[test]
    fn every_command_round_trips() {
        let locator = BlockLocator {
            version: 70_015,
            locator: vec![[1u8; 32], [2u8; 32]],
            stop: [0u8; 32],
        };
        let range = FilterRange {
            filter_type: 0,
            start_height: 41,
            stop_hash: [3u8; 32],
        };
        let items = vec![
            Inventory {
                kind: MSG_BLOCK,
                hash: [4u8; 32],
            },
            Inventory {
                kind: MSG_WITNESS_TX,
                hash: [5u8; 32],
            },
        ];
        let samples = vec![
            Message::Version(VersionMessage {
                version: 70_015,
                services: services::NETWORK,
                timestamp: 1_700_000_000,
                receiver: NetAddress::from_socket("10.0.0.1:8333".parse().expect("addr"), 0),
                sender: NetAddress::unroutable(),
                nonce: 11,
                user_agent: "/cfsync:0.1.0/".to_string(),
                start_height: 1,
                relay: false,
            }),
            Message::Verack,
            Message::Ping(0xdead_beef),
            Message::Pong(0xfeed_face),
            Message::Getaddr,
            Message::Addr(vec![TimestampedAddress {
                time: 1_700_000_000,
                address: NetAddress::from_socket("10.0.0.2:8333".parse().expect("addr"), 1),
            }]),
            Message::Getheaders(locator.clone()),
            Message::Headers(vec![sample_header(), sample_header()]),
            Message::Getcfheaders(range),
            Message::Cfheaders(CfHeaders {
                filter_type: 0,
                stop_hash: [6u8; 32],
                previous_header: [7u8; 32],
                filter_hashes: vec![[8u8; 32]],
            }),
            Message::Getcfilters(range),
            Message::Cfilter(CFilter {
                filter_type: 0,
                block_hash: [9u8; 32],
                filter: vec![0x01, 0x7f, 0x80],
            }),
            Message::Getcfcheckpt(FilterCheckpointRequest {
                filter_type: 0,
                stop_hash: [10u8; 32],
            }),
            Message::Cfcheckpt(CfCheckpt {
                filter_type: 0,
                stop_hash: [10u8; 32],
                headers: vec![[11u8; 32], [12u8; 32]],
            }),
            Message::Inv(items.clone()),
            Message::Getdata(items.clone()),
            Message::Notfound(items),
            Message::Block(vec![1, 2, 3, 4]),
            Message::Tx(vec![5, 6, 7]),
            Message::Reject(RejectMessage {
                message: "tx".to_string(),
                code: 0x40,
                reason: "non-final".to_string(),
                data: Some([13u8; 32]),
            }),
            Message::Sendcmpct {
                announce: true,
                version: 2,
            },
            Message::Sendheaders,
            Message::Feefilter(1_000),
            Message::Mempool,
            Message::Filterload(FilterLoad {
                filter: vec![0xaa; 16],
                hash_funcs: 5,
                tweak: 7,
                flags: 1,
            }),
            Message::Filteradd(vec![0xbb; 20]),
            Message::Filterclear,
            Message::Getblocks(locator),
            Message::Getblocktxn(BlockTxnRequest {
                block_hash: [14u8; 32],
                indexes: vec![2, 3, 10],
            }),
            Message::Blocktxn(BlockTxn {
                block_hash: [15u8; 32],
                transactions: vec![1, 0xcc],
            }),
            Message::Merkleblock(MerkleBlock {
                header: sample_header(),
                total_transactions: 3,
                hashes: vec![[16u8; 32], [17u8; 32]],
                flags: vec![0x1d],
            }),
            Message::Cmpctblock(CompactBlock {
                header: sample_header(),
                nonce: 99,
                short_ids: vec![[1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1]],
                prefilled: vec![0],
            }),
        ];

        let covered = samples
            .iter()
            .filter_map(Message::command)
            .collect::<Vec<_>>();
        for command in Command::ALL {
            assert!(covered.contains(&command), "no sample for {}", command.as_str());
        }
        for message in &samples {
            assert_eq!(&through_wire(message), message, "{}", message.name());
        }
    }

    #[test]
    fn reject_hash_is_optional() {
        let with_hash = Message::Reject(RejectMessage {
            message: "block".to_string(),
            code: 0x10,
            reason: "bad-diffbits".to_string(),
            data: Some([4u8; 32]),
        });
        assert_eq!(through_wire(&with_hash), with_hash);

        let without = Message::Reject(RejectMessage {
            message: "version".to_string(),
            code: 0x11,
            reason: "obsolete".to_string(),
            data: None,
        });
        assert_eq!(through_wire(&without), without);
    }

    #[test]
    fn unknown_command_is_unsupported_and_bad_payload_is_malformed() {
        let params = chain_params(Chain::Bitcoin);
        let mut frame = encode_frame(&params, Command::Verack, &[1, 2]).expect("frame");
        frame[4..16].copy_from_slice(b"wtxidrelay\0\0");
        let (raw, _) = decode_frame(&params, &frame).expect("frame");
        assert_eq!(
            Message::decode(&params.wire, &raw),
            Ok(Message::Unsupported {
                command: "wtxidrelay".to_string(),
                payload: vec![1, 2],
            })
        );

        let frame = encode_frame(&params, Command::Ping, &[1, 2, 3]).expect("frame");
        let (raw, _) = decode_frame(&params, &frame).expect("frame");
        assert!(matches!(
            Message::decode(&params.wire, &raw),
            Err(WireError::Malformed {
                command: Command::Ping,
                ..
            })
        ));
    }

    #[test]
    fn addr_maps_ipv4_addresses() {
        let addr: SocketAddr = "192.0.2.7:18333".parse().expect("addr");
        let entry = NetAddress::from_socket(addr, services::NETWORK);
        assert_eq!(&entry.ip[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(entry.socket_addr(), addr);
        let message = Message::Addr(vec![TimestampedAddress {
            time: 1_700_000_000,
            address: entry,
        }]);
        assert_eq!(through_wire(&message), message);
    }
}
