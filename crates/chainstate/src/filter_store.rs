//! Filter header and filter tables, one pair per filter type.
//!
//! Filter headers are keyed by block hash and carry both the derived header
//! and the filter hash it commits to, so a downloaded filter can be checked
//! without recomputing the chain. Tips are stored per type in `FilterTips`.

use cfsync_consensus::{FilterType, Hash256};
use cfsync_primitives::{Decoder, Position};
use cfsync_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::FilterError;

const TIP_FILTER_HEADERS: u8 = b'h';
const TIP_FILTERS: u8 = b'f';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterHeaderRecord {
    pub header: Hash256,
    pub filter_hash: Hash256,
}

impl FilterHeaderRecord {
    fn encode(&self) -> [u8; 64] {
        let mut value = [0u8; 64];
        value[..32].copy_from_slice(&self.header);
        value[32..].copy_from_slice(&self.filter_hash);
        value
    }

    fn decode(bytes: &[u8]) -> Result<Self, FilterError> {
        let mut decoder = Decoder::new(bytes);
        let header = decoder.read_hash()?;
        let filter_hash = decoder.read_hash()?;
        decoder.finish()?;
        Ok(Self {
            header,
            filter_hash,
        })
    }
}

fn header_column(filter_type: FilterType) -> Column {
    match filter_type {
        FilterType::Basic => Column::FilterHeadersBasic,
        FilterType::BchVariant => Column::FilterHeadersBch,
        FilterType::Extended => Column::FilterHeadersExtended,
    }
}

fn filter_column(filter_type: FilterType) -> Column {
    match filter_type {
        FilterType::Basic => Column::FiltersBasic,
        FilterType::BchVariant => Column::FiltersBch,
        FilterType::Extended => Column::FiltersExtended,
    }
}

fn tip_key(kind: u8, filter_type: FilterType) -> [u8; 2] {
    [kind, filter_type.wire_id()]
}

pub struct FilterStore<S> {
    store: S,
}

impl<S: KeyValueStore> FilterStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn load_tip(&self, kind: u8, filter_type: FilterType) -> Result<Position, FilterError> {
        match self.store.get(Column::FilterTips, &tip_key(kind, filter_type))? {
            Some(bytes) => Ok(Position::from_bytes(&bytes)?),
            None => Ok(Position::blank()),
        }
    }

    /// Highest block with a validated filter header; blank before the first
    /// `cfheaders` is accepted.
    pub fn filter_header_tip(&self, filter_type: FilterType) -> Result<Position, FilterError> {
        self.load_tip(TIP_FILTER_HEADERS, filter_type)
    }

    /// Highest block such that it and every block below it have a filter.
    pub fn filter_tip(&self, filter_type: FilterType) -> Result<Position, FilterError> {
        self.load_tip(TIP_FILTERS, filter_type)
    }

    pub fn set_filter_header_tip(
        &self,
        filter_type: FilterType,
        tip: Position,
    ) -> Result<(), FilterError> {
        self.store.put(
            Column::FilterTips,
            &tip_key(TIP_FILTER_HEADERS, filter_type),
            &tip.to_bytes(),
        )?;
        Ok(())
    }

    pub fn set_filter_tip(&self, filter_type: FilterType, tip: Position) -> Result<(), FilterError> {
        self.store.put(
            Column::FilterTips,
            &tip_key(TIP_FILTERS, filter_type),
            &tip.to_bytes(),
        )?;
        Ok(())
    }

    pub fn load_filter_header(
        &self,
        filter_type: FilterType,
        block: &Hash256,
    ) -> Result<Option<FilterHeaderRecord>, FilterError> {
        match self.store.get(header_column(filter_type), block)? {
            Some(bytes) => Ok(Some(FilterHeaderRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn have_filter_header(
        &self,
        filter_type: FilterType,
        block: &Hash256,
    ) -> Result<bool, FilterError> {
        Ok(self.store.contains(header_column(filter_type), block)?)
    }

    pub fn load_filter_hash(
        &self,
        filter_type: FilterType,
        block: &Hash256,
    ) -> Result<Hash256, FilterError> {
        self.load_filter_header(filter_type, block)?
            .map(|record| record.filter_hash)
            .ok_or(FilterError::NotFound {
                filter_type,
                block: *block,
            })
    }

    pub fn load_filter(
        &self,
        filter_type: FilterType,
        block: &Hash256,
    ) -> Result<Option<Vec<u8>>, FilterError> {
        Ok(self.store.get(filter_column(filter_type), block)?)
    }

    pub fn have_filter(&self, filter_type: FilterType, block: &Hash256) -> Result<bool, FilterError> {
        Ok(self.store.contains(filter_column(filter_type), block)?)
    }

    /// Writes a run of filter headers and the new tip in one batch.
    pub fn store_filter_headers(
        &self,
        filter_type: FilterType,
        records: &[(Hash256, FilterHeaderRecord)],
        tip: Position,
    ) -> Result<(), FilterError> {
        let column = header_column(filter_type);
        let mut batch = WriteBatch::new();
        for (block, record) in records {
            batch.put(column, *block, record.encode());
        }
        batch.put(
            Column::FilterTips,
            tip_key(TIP_FILTER_HEADERS, filter_type),
            tip.to_bytes(),
        );
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Writes one filter; `tip` is set in the same batch when it advances.
    pub fn store_filter(
        &self,
        filter_type: FilterType,
        block: &Hash256,
        filter: &[u8],
        tip: Option<Position>,
    ) -> Result<(), FilterError> {
        let mut batch = WriteBatch::new();
        batch.put(filter_column(filter_type), *block, filter);
        if let Some(tip) = tip {
            batch.put(
                Column::FilterTips,
                tip_key(TIP_FILTERS, filter_type),
                tip.to_bytes(),
            );
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfsync_storage::memory::MemoryStore;

    #[test]
    fn tips_start_blank_and_are_per_type() {
        let store = FilterStore::new(MemoryStore::new());
        assert!(store.filter_header_tip(FilterType::Basic).expect("tip").is_blank());
        assert!(store.filter_tip(FilterType::Basic).expect("tip").is_blank());

        let tip = Position::new(5, [5u8; 32]);
        store
            .set_filter_header_tip(FilterType::Basic, tip)
            .expect("set");
        assert_eq!(store.filter_header_tip(FilterType::Basic).expect("tip"), tip);
        assert!(store
            .filter_header_tip(FilterType::Extended)
            .expect("tip")
            .is_blank());
        assert!(store.filter_tip(FilterType::Basic).expect("tip").is_blank());
    }

    #[test]
    fn header_records_carry_filter_hash() {
        let store = FilterStore::new(MemoryStore::new());
        let record = FilterHeaderRecord {
            header: [1u8; 32],
            filter_hash: [2u8; 32],
        };
        store
            .store_filter_headers(
                FilterType::Basic,
                &[([9u8; 32], record)],
                Position::new(0, [9u8; 32]),
            )
            .expect("store");
        assert_eq!(
            store.load_filter_hash(FilterType::Basic, &[9u8; 32]),
            Ok([2u8; 32])
        );
        assert!(!store
            .have_filter_header(FilterType::BchVariant, &[9u8; 32])
            .expect("have"));
        assert!(matches!(
            store.load_filter_hash(FilterType::Basic, &[8u8; 32]),
            Err(FilterError::NotFound { .. })
        ));
    }
}
