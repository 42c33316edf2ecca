//! Per-chain parameter table.
//!
//! Everything the sync client needs to know about a chain lives here: the
//! message start bytes, ports, DNS seeds, genesis header fields, the proof of
//! work limit and the wire dialect. Code elsewhere must look these up through
//! [`chain_params`] instead of hardcoding values for one chain.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Bitcoin,
    BitcoinTestnet3,
    BitcoinCash,
    BitcoinCashTestnet3,
    Regtest,
}

impl Chain {
    pub const ALL: [Chain; 5] = [
        Chain::Bitcoin,
        Chain::BitcoinTestnet3,
        Chain::BitcoinCash,
        Chain::BitcoinCashTestnet3,
        Chain::Regtest,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bitcoin" | "btc" | "mainnet" => Some(Self::Bitcoin),
            "testnet3" | "btc-testnet3" | "testnet" => Some(Self::BitcoinTestnet3),
            "bch" | "bitcoincash" => Some(Self::BitcoinCash),
            "bch-testnet3" | "bitcoincash-testnet3" => Some(Self::BitcoinCashTestnet3),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bitcoin => "bitcoin",
            Self::BitcoinTestnet3 => "testnet3",
            Self::BitcoinCash => "bch",
            Self::BitcoinCashTestnet3 => "bch-testnet3",
            Self::Regtest => "regtest",
        }
    }

    /// Stable one-byte tag used when deriving peer address identifiers.
    pub fn id(self) -> u8 {
        match self {
            Self::Bitcoin => 1,
            Self::BitcoinTestnet3 => 2,
            Self::BitcoinCash => 3,
            Self::BitcoinCashTestnet3 => 4,
            Self::Regtest => 5,
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact block filter flavours. Each type has its own tables and tips.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum FilterType {
    Basic,
    BchVariant,
    Extended,
}

impl FilterType {
    pub const ALL: [FilterType; 3] = [
        FilterType::Basic,
        FilterType::BchVariant,
        FilterType::Extended,
    ];

    /// Filter type byte carried in `getcfheaders`/`cfheaders`/`getcfilters`/`cfilter`.
    pub fn wire_id(self) -> u8 {
        match self {
            Self::Basic => 0x00,
            Self::BchVariant => 0x01,
            Self::Extended => 0x58,
        }
    }

    pub fn from_wire_id(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Basic),
            0x01 => Some(Self::BchVariant),
            0x58 => Some(Self::Extended),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "basic" => Some(Self::Basic),
            "bch" | "bch-variant" => Some(Self::BchVariant),
            "extended" => Some(Self::Extended),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::BchVariant => "bch-variant",
            Self::Extended => "extended",
        }
    }
}

impl std::fmt::Display for FilterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How competing chains are ranked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BestChainRule {
    CumulativeWork,
    Height,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestKind {
    Sha256d,
}

/// Framing and encoding conventions of a chain's peer protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WireDialect {
    pub max_payload: u32,
    pub checksum: DigestKind,
    pub block_hash: DigestKind,
    /// `headers` entries are followed by a (zero) transaction count.
    pub header_tx_count: bool,
    /// Hashes are shown to humans in reversed byte order.
    pub display_reversed: bool,
}

const BITCOIN_DIALECT: WireDialect = WireDialect {
    max_payload: 32 * 1024 * 1024,
    checksum: DigestKind::Sha256d,
    block_hash: DigestKind::Sha256d,
    header_tx_count: true,
    display_reversed: true,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GenesisHeader {
    pub version: i32,
    /// Merkle root in display order.
    pub merkle_root: &'static str,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub chain: Chain,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
    pub genesis: GenesisHeader,
    pub pow_limit: Hash256,
    pub best_chain_rule: BestChainRule,
    pub checkpoint: Option<Checkpoint>,
    pub default_filter_type: FilterType,
    pub wire: WireDialect,
}

const GENESIS_MERKLE_ROOT: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

const BITCOIN_DNS_SEEDS: [&str; 8] = [
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
    "seed.bitcoin.jonasschnelli.ch",
    "seed.btc.petertodd.org",
    "seed.bitcoin.sprovoost.nl",
    "dnsseed.emzy.de",
];

const BITCOIN_TESTNET_DNS_SEEDS: [&str; 4] = [
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
    "seed.testnet.bitcoin.sprovoost.nl",
    "testnet-seed.bluematt.me",
];

const BCH_DNS_SEEDS: [&str; 5] = [
    "seed.bitcoinabc.org",
    "seed-abc.bitcoinforks.org",
    "btccash-seeder.bitcoinunlimited.info",
    "seed.bitprim.org",
    "seed.deadalnix.me",
];

const BCH_TESTNET_DNS_SEEDS: [&str; 4] = [
    "testnet-seed.bitcoinabc.org",
    "testnet-seed-abc.bitcoinforks.org",
    "testnet-seed.bitprim.org",
    "testnet-seed.deadalnix.me",
];

const MAINNET_POW_LIMIT: &str = "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
const REGTEST_POW_LIMIT: &str = "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

pub fn chain_params(chain: Chain) -> ChainParams {
    match chain {
        Chain::Bitcoin => bitcoin_params(),
        Chain::BitcoinTestnet3 => testnet3_params(Chain::BitcoinTestnet3),
        Chain::BitcoinCash => bitcoin_cash_params(),
        Chain::BitcoinCashTestnet3 => testnet3_params(Chain::BitcoinCashTestnet3),
        Chain::Regtest => regtest_params(),
    }
}

fn hash_const(hex: &str) -> Hash256 {
    match hash256_from_hex(hex) {
        Ok(hash) => hash,
        Err(err) => panic!("invalid chain table constant {hex}: {err}"),
    }
}

fn mainnet_genesis() -> GenesisHeader {
    GenesisHeader {
        version: 1,
        merkle_root: GENESIS_MERKLE_ROOT,
        time: 1_231_006_505,
        bits: 0x1d00_ffff,
        nonce: 2_083_236_893,
    }
}

fn testnet_genesis() -> GenesisHeader {
    GenesisHeader {
        version: 1,
        merkle_root: GENESIS_MERKLE_ROOT,
        time: 1_296_688_602,
        bits: 0x1d00_ffff,
        nonce: 414_098_458,
    }
}

fn bitcoin_params() -> ChainParams {
    ChainParams {
        chain: Chain::Bitcoin,
        message_start: [0xf9, 0xbe, 0xb4, 0xd9],
        default_port: 8_333,
        dns_seeds: &BITCOIN_DNS_SEEDS,
        genesis: mainnet_genesis(),
        pow_limit: hash_const(MAINNET_POW_LIMIT),
        best_chain_rule: BestChainRule::CumulativeWork,
        checkpoint: Some(Checkpoint {
            height: 11_111,
            hash: hash_const("0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
        }),
        default_filter_type: FilterType::Basic,
        wire: BITCOIN_DIALECT,
    }
}

fn bitcoin_cash_params() -> ChainParams {
    ChainParams {
        chain: Chain::BitcoinCash,
        message_start: [0xe3, 0xe1, 0xf3, 0xe8],
        dns_seeds: &BCH_DNS_SEEDS,
        default_filter_type: FilterType::BchVariant,
        ..bitcoin_params()
    }
}

fn testnet3_params(chain: Chain) -> ChainParams {
    let (message_start, dns_seeds, default_filter_type): (_, &'static [&'static str], _) =
        match chain {
            Chain::BitcoinCashTestnet3 => (
                [0xf4, 0xe5, 0xf3, 0xf4],
                &BCH_TESTNET_DNS_SEEDS,
                FilterType::BchVariant,
            ),
            _ => (
                [0x0b, 0x11, 0x09, 0x07],
                &BITCOIN_TESTNET_DNS_SEEDS,
                FilterType::Basic,
            ),
        };
    ChainParams {
        chain,
        message_start,
        default_port: 18_333,
        dns_seeds,
        genesis: testnet_genesis(),
        pow_limit: hash_const(MAINNET_POW_LIMIT),
        best_chain_rule: BestChainRule::CumulativeWork,
        checkpoint: Some(Checkpoint {
            height: 546,
            hash: hash_const("000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70"),
        }),
        default_filter_type,
        wire: BITCOIN_DIALECT,
    }
}

fn regtest_params() -> ChainParams {
    ChainParams {
        chain: Chain::Regtest,
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 18_444,
        dns_seeds: &[],
        genesis: GenesisHeader {
            version: 1,
            merkle_root: GENESIS_MERKLE_ROOT,
            time: 1_296_688_602,
            bits: 0x207f_ffff,
            nonce: 2,
        },
        pow_limit: hash_const(REGTEST_POW_LIMIT),
        best_chain_rule: BestChainRule::CumulativeWork,
        checkpoint: None,
        default_filter_type: FilterType::Basic,
        wire: BITCOIN_DIALECT,
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 1 to 64 digits"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into internal byte order.
/// Short input is left-padded with zeros.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let trimmed = input.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut out = [0u8; 32];
    // Walk from the least significant digit so odd lengths pad naturally.
    for (index, digit) in hex.bytes().rev().enumerate() {
        let value = (digit as char).to_digit(16).ok_or(HexError::InvalidHex)? as u8;
        let byte = &mut out[index / 2];
        if index % 2 == 0 {
            *byte |= value;
        } else {
            *byte |= value << 4;
        }
    }
    Ok(out)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
