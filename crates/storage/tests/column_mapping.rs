use cfsync_storage::{Column, WriteBatch};

#[test]
fn column_index_and_bit_are_stable() {
    let mut seen = 0u32;
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
        assert_eq!(column.bit(), 1u32 << idx);
        assert_eq!(seen & column.bit(), 0, "duplicate bit for {column:?}");
        seen |= column.bit();
    }
    assert_eq!(Column::ALL.len(), Column::COUNT);
}

#[test]
fn batch_reports_touched_columns() {
    let mut batch = WriteBatch::new();
    assert_eq!(batch.touched(), 0);
    batch.put(Column::HeaderIndex, [1u8; 32], b"record");
    batch.delete(Column::Siblings, [2u8; 32]);
    batch.put(Column::HeaderIndex, [3u8; 32], b"record");
    assert_eq!(
        batch.touched(),
        Column::HeaderIndex.bit() | Column::Siblings.bit()
    );
    assert_eq!(batch.len(), 3);
}
