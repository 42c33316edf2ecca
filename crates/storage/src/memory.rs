use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory backend with one reader-writer lock per column.
///
/// Batches lock every column they touch, in column order, before applying
/// anything, so a reader sees either none or all of a batch.
pub struct MemoryStore {
    tables: [RwLock<Table>; Column::COUNT],
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            tables: std::array::from_fn(|_| RwLock::new(Table::new())),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, column: Column) -> Result<RwLockReadGuard<'_, Table>, StoreError> {
        self.tables[column.index()]
            .read()
            .map_err(|_| StoreError::Poisoned(column))
    }

    fn write(&self, column: Column) -> Result<RwLockWriteGuard<'_, Table>, StoreError> {
        self.tables[column.index()]
            .write()
            .map_err(|_| StoreError::Poisoned(column))
    }

    /// Number of entries in a column.
    pub fn len(&self, column: Column) -> Result<usize, StoreError> {
        Ok(self.read(column)?.len())
    }
}

fn prefix_range<'t>(
    table: &'t Table,
    prefix: &'t [u8],
) -> impl Iterator<Item = (&'t Vec<u8>, &'t Vec<u8>)> + 't {
    table
        .range(prefix.to_vec()..)
        .take_while(move |(key, _)| key.starts_with(prefix))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read(column)?.get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(column)?.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.write(column)?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let table = self.read(column)?;
        Ok(prefix_range(&table, prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let table = self.read(column)?;
        for (key, value) in prefix_range(&table, prefix) {
            visitor(key, value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let touched = batch.touched();
        let mut guards: Vec<Option<RwLockWriteGuard<'_, Table>>> =
            (0..Column::COUNT).map(|_| None).collect();
        for column in Column::ALL {
            if touched & column.bit() != 0 {
                guards[column.index()] = Some(self.write(column)?);
            }
        }
        for op in batch.iter() {
            let Some(table) = guards[op.column().index()].as_mut() else {
                continue;
            };
            match op {
                WriteOp::Put { key, value, .. } => {
                    table.insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { key, .. } => {
                    table.remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_inside_prefix_and_column() {
        let store = MemoryStore::new();
        store.put(Column::Disconnected, b"aa1", b"x").expect("put");
        store.put(Column::Disconnected, b"aa2", b"y").expect("put");
        store.put(Column::Disconnected, b"ab1", b"z").expect("put");
        store.put(Column::Siblings, b"aa3", b"w").expect("put");

        let found = store.scan_prefix(Column::Disconnected, b"aa").expect("scan");
        assert_eq!(
            found,
            vec![
                (b"aa1".to_vec(), b"x".to_vec()),
                (b"aa2".to_vec(), b"y".to_vec())
            ]
        );
        let mut count = 0;
        store
            .for_each_prefix(Column::Disconnected, b"", &mut |_, _| {
                count += 1;
                Ok(())
            })
            .expect("visit");
        assert_eq!(count, 3);
    }

    #[test]
    fn batch_applies_in_order_across_columns() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"old", b"1").expect("put");

        let mut batch = WriteBatch::new();
        batch.put(Column::HeaderIndex, b"h", b"header");
        batch.put(Column::Meta, b"tip", b"a");
        batch.put(Column::Meta, b"tip", b"b");
        batch.delete(Column::Meta, b"old");
        store.write_batch(&batch).expect("commit");

        assert_eq!(store.get(Column::Meta, b"tip").expect("get"), Some(b"b".to_vec()));
        assert_eq!(store.get(Column::Meta, b"old").expect("get"), None);
        assert!(store.contains(Column::HeaderIndex, b"h").expect("contains"));
        assert_eq!(store.len(Column::Meta).expect("len"), 1);
    }

    #[test]
    fn dropped_batch_leaves_store_untouched() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Peers, b"peer", b"record");
        drop(batch);
        assert_eq!(store.len(Column::Peers).expect("len"), 0);
    }
}
