use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

/// BTreeMap-backed store with the same visible semantics as the fjall
/// backend; used by tests and the tooling paths.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables
            .get(&column)
            .and_then(|table| table.get(key))
            .cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        tables
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if let Some(table) = tables.get_mut(&column) {
            table.remove(key);
        }
        Ok(())
    }

    fn scan(&self, column: Column) -> Result<ScanResult, StoreError> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables
            .get(&column)
            .map(|table| {
                table
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    tables
                        .entry(*column)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(table) = tables.get_mut(column) {
                        table.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        store.put(Column::Blocks, b"k", b"v").unwrap();
        assert_eq!(store.get(Column::Blocks, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get(Column::Utxo, b"k").unwrap(), None);
        store.delete(Column::Blocks, b"k").unwrap();
        assert_eq!(store.get(Column::Blocks, b"k").unwrap(), None);
    }

    #[test]
    fn batch_spans_columns() {
        let store = MemoryStore::new();
        store.put(Column::Utxo, b"stale", b"x").unwrap();

        let mut batch = WriteBatch::new();
        batch.put(Column::Blocks, b"hash".to_vec(), b"block".to_vec());
        batch.put(Column::Blocks, b"l".to_vec(), b"hash".to_vec());
        batch.delete(Column::Utxo, b"stale".to_vec());
        batch.put(Column::Utxo, b"fresh".to_vec(), b"y".to_vec());
        store.write_batch(&batch).unwrap();

        assert_eq!(
            store.get(Column::Blocks, b"l").unwrap(),
            Some(b"hash".to_vec())
        );
        assert_eq!(store.get(Column::Utxo, b"stale").unwrap(), None);
        assert_eq!(store.get(Column::Utxo, b"fresh").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn scan_is_key_ordered() {
        let store = MemoryStore::new();
        store.put(Column::Utxo, b"b", b"2").unwrap();
        store.put(Column::Utxo, b"a", b"1").unwrap();
        store.put(Column::Utxo, b"c", b"3").unwrap();
        let keys: Vec<_> = store
            .scan(Column::Utxo)
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
