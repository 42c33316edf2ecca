//! Message framing: magic, 12-byte command, payload length and checksum.
//!
//! Everything here is pure except [`read_frame`] and [`write_frame`], which
//! move whole frames over an async stream. Payload contents are handled by
//! [`crate::messages`].

use std::fmt;

use cfsync_consensus::ChainParams;
use cfsync_primitives::{checksum, DecodeError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 24;
pub const COMMAND_LEN: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    Getaddr,
    Addr,
    Getheaders,
    Headers,
    Getcfheaders,
    Cfheaders,
    Getcfilters,
    Cfilter,
    Getcfcheckpt,
    Cfcheckpt,
    Inv,
    Getdata,
    Notfound,
    Block,
    Tx,
    Reject,
    Sendcmpct,
    Sendheaders,
    Feefilter,
    Mempool,
    Filterload,
    Filteradd,
    Filterclear,
    Getblocks,
    Getblocktxn,
    Blocktxn,
    Merkleblock,
    Cmpctblock,
}

impl Command {
    pub const ALL: [Command; 32] = [
        Command::Version,
        Command::Verack,
        Command::Ping,
        Command::Pong,
        Command::Getaddr,
        Command::Addr,
        Command::Getheaders,
        Command::Headers,
        Command::Getcfheaders,
        Command::Cfheaders,
        Command::Getcfilters,
        Command::Cfilter,
        Command::Getcfcheckpt,
        Command::Cfcheckpt,
        Command::Inv,
        Command::Getdata,
        Command::Notfound,
        Command::Block,
        Command::Tx,
        Command::Reject,
        Command::Sendcmpct,
        Command::Sendheaders,
        Command::Feefilter,
        Command::Mempool,
        Command::Filterload,
        Command::Filteradd,
        Command::Filterclear,
        Command::Getblocks,
        Command::Getblocktxn,
        Command::Blocktxn,
        Command::Merkleblock,
        Command::Cmpctblock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Getaddr => "getaddr",
            Command::Addr => "addr",
            Command::Getheaders => "getheaders",
            Command::Headers => "headers",
            Command::Getcfheaders => "getcfheaders",
            Command::Cfheaders => "cfheaders",
            Command::Getcfilters => "getcfilters",
            Command::Cfilter => "cfilter",
            Command::Getcfcheckpt => "getcfcheckpt",
            Command::Cfcheckpt => "cfcheckpt",
            Command::Inv => "inv",
            Command::Getdata => "getdata",
            Command::Notfound => "notfound",
            Command::Block => "block",
            Command::Tx => "tx",
            Command::Reject => "reject",
            Command::Sendcmpct => "sendcmpct",
            Command::Sendheaders => "sendheaders",
            Command::Feefilter => "feefilter",
            Command::Mempool => "mempool",
            Command::Filterload => "filterload",
            Command::Filteradd => "filteradd",
            Command::Filterclear => "filterclear",
            Command::Getblocks => "getblocks",
            Command::Getblocktxn => "getblocktxn",
            Command::Blocktxn => "blocktxn",
            Command::Merkleblock => "merkleblock",
            Command::Cmpctblock => "cmpctblock",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Command::ALL
            .iter()
            .copied()
            .find(|command| command.as_str() == name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    WrongNetwork { expected: [u8; 4], found: [u8; 4] },
    BadChecksum { expected: [u8; 4], found: [u8; 4] },
    PayloadTooLarge { length: u32, limit: u32 },
    Truncated,
    /// Command field is not NUL-padded printable ASCII.
    BadCommand,
    Malformed { command: Command, error: DecodeError },
    Io(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::WrongNetwork { expected, found } => write!(
                f,
                "wrong network magic {} (expected {})",
                hex4(found),
                hex4(expected)
            ),
            WireError::BadChecksum { expected, found } => write!(
                f,
                "payload checksum {} does not match {}",
                hex4(found),
                hex4(expected)
            ),
            WireError::PayloadTooLarge { length, limit } => {
                write!(f, "payload of {length} bytes exceeds limit {limit}")
            }
            WireError::Truncated => write!(f, "truncated message"),
            WireError::BadCommand => write!(f, "invalid command field"),
            WireError::Malformed { command, error } => {
                write!(f, "malformed {command} payload: {error}")
            }
            WireError::Io(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(err.to_string())
        }
    }
}

impl WireError {
    /// Transport failures are not the peer's fault; everything else is.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, WireError::Io(_) | WireError::Truncated)
    }
}

fn hex4(bytes: &[u8; 4]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; COMMAND_LEN],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn new(params: &ChainParams, command: Command, payload: &[u8]) -> Self {
        Self {
            magic: params.message_start,
            command: command_bytes(command.as_str()),
            length: payload.len() as u32,
            checksum: checksum(params.wire.checksum, payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.magic);
        out[4..16].copy_from_slice(&self.command);
        out[16..20].copy_from_slice(&self.length.to_le_bytes());
        out[20..].copy_from_slice(&self.checksum);
        out
    }

    /// Parses the fixed header and checks magic and length against the chain.
    pub fn parse(params: &ChainParams, bytes: &[u8; HEADER_LEN]) -> Result<Self, WireError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        if magic != params.message_start {
            return Err(WireError::WrongNetwork {
                expected: params.message_start,
                found: magic,
            });
        }
        let mut command = [0u8; COMMAND_LEN];
        command.copy_from_slice(&bytes[4..16]);
        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        if length > params.wire.max_payload {
            return Err(WireError::PayloadTooLarge {
                length,
                limit: params.wire.max_payload,
            });
        }
        let mut sum = [0u8; 4];
        sum.copy_from_slice(&bytes[20..]);
        let header = Self {
            magic,
            command,
            length,
            checksum: sum,
        };
        header.command_name()?;
        Ok(header)
    }

    /// The command name without NUL padding.
    pub fn command_name(&self) -> Result<&str, WireError> {
        let end = self
            .command
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(COMMAND_LEN);
        if end == 0 || self.command[end..].iter().any(|byte| *byte != 0) {
            return Err(WireError::BadCommand);
        }
        let name = &self.command[..end];
        if !name.iter().all(|byte| byte.is_ascii_graphic()) {
            return Err(WireError::BadCommand);
        }
        std::str::from_utf8(name).map_err(|_| WireError::BadCommand)
    }

    /// `None` for well-formed names this codec does not know.
    pub fn command(&self) -> Result<Option<Command>, WireError> {
        Ok(Command::from_name(self.command_name()?))
    }

    pub fn verify(&self, params: &ChainParams, payload: &[u8]) -> Result<(), WireError> {
        if payload.len() != self.length as usize {
            return Err(WireError::Truncated);
        }
        let found = checksum(params.wire.checksum, payload);
        if found != self.checksum {
            return Err(WireError::BadChecksum {
                expected: self.checksum,
                found,
            });
        }
        Ok(())
    }
}

fn command_bytes(name: &str) -> [u8; COMMAND_LEN] {
    let mut out = [0u8; COMMAND_LEN];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

/// A frame whose header and checksum have been verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

pub fn encode_frame(
    params: &ChainParams,
    command: Command,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    if payload.len() > params.wire.max_payload as usize {
        return Err(WireError::PayloadTooLarge {
            length: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            limit: params.wire.max_payload,
        });
    }
    let header = MessageHeader::new(params, command, payload);
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decodes one complete frame from the front of `bytes` and reports how
/// many bytes it used.
pub fn decode_frame(params: &ChainParams, bytes: &[u8]) -> Result<(RawMessage, usize), WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let mut raw_header = [0u8; HEADER_LEN];
    raw_header.copy_from_slice(&bytes[..HEADER_LEN]);
    let header = MessageHeader::parse(params, &raw_header)?;
    let end = HEADER_LEN + header.length as usize;
    if bytes.len() < end {
        return Err(WireError::Truncated);
    }
    let payload = bytes[HEADER_LEN..end].to_vec();
    header.verify(params, &payload)?;
    Ok((RawMessage { header, payload }, end))
}

pub async fn read_frame<R>(reader: &mut R, params: &ChainParams) -> Result<RawMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut raw_header = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw_header).await?;
    let header = MessageHeader::parse(params, &raw_header)?;
    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await?;
    header.verify(params, &payload)?;
    Ok(RawMessage { header, payload })
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfsync_consensus::{chain_params, Chain};

    #[test]
    fn verack_frame_matches_mainnet_bytes() {
        let params = chain_params(Chain::Bitcoin);
        let frame = encode_frame(&params, Command::Verack, &[]).expect("frame");
        assert_eq!(
            frame,
            [
                0xf9, 0xbe, 0xb4, 0xd9, b'v', b'e', b'r', b'a', b'c', b'k', 0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0x5d, 0xf6, 0xe0, 0xe2,
            ]
        );
        let (raw, used) = decode_frame(&params, &frame).expect("decode");
        assert_eq!(used, HEADER_LEN);
        assert_eq!(raw.header.command(), Ok(Some(Command::Verack)));
    }

    #[test]
    fn frame_checks_magic_checksum_and_length() {
        let bitcoin = chain_params(Chain::Bitcoin);
        let regtest = chain_params(Chain::Regtest);
        let mut frame = encode_frame(&bitcoin, Command::Ping, &7u64.to_le_bytes()).expect("frame");

        assert!(matches!(
            decode_frame(&regtest, &frame),
            Err(WireError::WrongNetwork { .. })
        ));
        assert_eq!(
            decode_frame(&bitcoin, &frame[..HEADER_LEN + 3]),
            Err(WireError::Truncated)
        );

        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let err = decode_frame(&bitcoin, &frame).expect_err("checksum");
        assert!(matches!(err, WireError::BadChecksum { .. }));
        assert!(err.is_protocol_violation());

        let mut oversized = encode_frame(&bitcoin, Command::Tx, &[]).expect("frame");
        oversized[16..20].copy_from_slice(&(bitcoin.wire.max_payload + 1).to_le_bytes());
        assert!(matches!(
            decode_frame(&bitcoin, &oversized),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn unknown_and_garbled_commands() {
        let params = chain_params(Chain::Bitcoin);
        let mut frame = encode_frame(&params, Command::Mempool, &[]).expect("frame");
        frame[4..16].copy_from_slice(b"wtxidrelay\0\0");
        frame[20..24].copy_from_slice(&checksum(params.wire.checksum, &[]));
        let (raw, _) = decode_frame(&params, &frame).expect("well-formed unknown command");
        assert_eq!(raw.header.command_name(), Ok("wtxidrelay"));
        assert_eq!(raw.header.command(), Ok(None));

        frame[4..16].copy_from_slice(b"ver\0ack\0\0\0\0\0");
        assert_eq!(decode_frame(&params, &frame), Err(WireError::BadCommand));
    }

    #[tokio::test]
    async fn frames_stream_in_order() {
        let params = chain_params(Chain::Regtest);
        let mut bytes = encode_frame(&params, Command::Verack, &[]).expect("frame");
        bytes.extend(encode_frame(&params, Command::Pong, &9u64.to_le_bytes()).expect("frame"));
        let mut reader = bytes.as_slice();

        let first = read_frame(&mut reader, &params).await.expect("first");
        assert_eq!(first.header.command(), Ok(Some(Command::Verack)));
        let second = read_frame(&mut reader, &params).await.expect("second");
        assert_eq!(second.payload, 9u64.to_le_bytes());
        assert_eq!(
            read_frame(&mut reader, &params).await,
            Err(WireError::Truncated)
        );
    }
}
