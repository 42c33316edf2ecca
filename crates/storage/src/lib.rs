//! Key/value storage used by the header, filter and peer stores.
//!
//! Data is split into [`Column`]s, one per logical table. Backends lock (or
//! partition) per column, so header writes never block filter reads. A
//! [`WriteBatch`] is the transaction: committing it through
//! [`KeyValueStore::write_batch`] applies every op or none, and dropping it
//! uncommitted discards it.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Backend(String),
    Poisoned(Column),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::Poisoned(column) => write!(f, "{} table lock poisoned", column.as_str()),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// block hash -> stored header record
    HeaderIndex,
    /// height (big-endian) -> block hash on the best chain
    BestChain,
    /// block hash -> () for tips of non-best branches
    Siblings,
    /// parent hash || child hash -> receive time || raw header
    Disconnected,
    FilterHeadersBasic,
    FilterHeadersBch,
    FilterHeadersExtended,
    FiltersBasic,
    FiltersBch,
    FiltersExtended,
    /// tip kind || filter type -> position
    FilterTips,
    /// address id -> json peer record
    Peers,
    Meta,
}

impl Column {
    pub const COUNT: usize = 13;

    pub const ALL: [Column; Column::COUNT] = [
        Column::HeaderIndex,
        Column::BestChain,
        Column::Siblings,
        Column::Disconnected,
        Column::FilterHeadersBasic,
        Column::FilterHeadersBch,
        Column::FilterHeadersExtended,
        Column::FiltersBasic,
        Column::FiltersBch,
        Column::FiltersExtended,
        Column::FilterTips,
        Column::Peers,
        Column::Meta,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn bit(self) -> u32 {
        1 << self.index()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::HeaderIndex => "header_index",
            Column::BestChain => "best_chain",
            Column::Siblings => "siblings",
            Column::Disconnected => "disconnected",
            Column::FilterHeadersBasic => "filter_headers_basic",
            Column::FilterHeadersBch => "filter_headers_bch",
            Column::FilterHeadersExtended => "filter_headers_extended",
            Column::FiltersBasic => "filters_basic",
            Column::FiltersBch => "filters_bch",
            Column::FiltersExtended => "filters_extended",
            Column::FilterTips => "filter_tips",
            Column::Peers => "peers",
            Column::Meta => "meta",
        }
    }
}

/// Keys are hashes, heights or hash pairs; 64 inline bytes covers all of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteKey(SmallVec<[u8; 64]>);

/// Header records and filter header records fit inline; filters spill to the heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteValue(SmallVec<[u8; 128]>);

macro_rules! byte_buffer {
    ($name:ident) => {
        impl $name {
            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }

            pub fn into_vec(self) -> Vec<u8> {
                self.0.into_vec()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.as_slice()
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(value: Vec<u8>) -> Self {
                Self(SmallVec::from_vec(value))
            }
        }

        impl From<&[u8]> for $name {
            fn from(value: &[u8]) -> Self {
                Self(SmallVec::from_slice(value))
            }
        }

        impl<const N: usize> From<[u8; N]> for $name {
            fn from(value: [u8; N]) -> Self {
                Self(SmallVec::from_slice(&value))
            }
        }

        impl<const N: usize> From<&[u8; N]> for $name {
            fn from(value: &[u8; N]) -> Self {
                Self(SmallVec::from_slice(value))
            }
        }
    };
}

byte_buffer!(WriteKey);
byte_buffer!(WriteValue);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

impl WriteOp {
    pub fn column(&self) -> Column {
        match self {
            WriteOp::Put { column, .. } | WriteOp::Delete { column, .. } => *column,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Bit set of the columns this batch writes to.
    pub fn touched(&self) -> u32 {
        self.ops.iter().fold(0, |mask, op| mask | op.column().bit())
    }

    pub fn append(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    /// Entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    /// Applies every op of `batch` atomically.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    fn contains(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(column, key)?.is_some())
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}
