use std::collections::HashMap;
use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp, ALL_COLUMNS};

/// fjall-backed store. One partition per column; the keyspace holds a
/// process-exclusive lock on the database directory for the lifetime
/// of the handle.
pub struct FjallStore {
    keyspace: Keyspace,
    partitions: HashMap<Column, PartitionHandle>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let keyspace = Config::new(path).open().map_err(map_err)?;
        let mut partitions = HashMap::new();
        for column in ALL_COLUMNS {
            let handle = keyspace
                .open_partition(column.as_str(), PartitionCreateOptions::default())
                .map_err(map_err)?;
            partitions.insert(column, handle);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(&column)
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let partition = self.partition(column)?;
        let value = partition.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        partition.insert(key, value).map_err(map_err)?;
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        partition.remove(key).map_err(map_err)?;
        Ok(())
    }

    fn scan(&self, column: Column) -> Result<ScanResult, StoreError> {
        let partition = self.partition(column)?;
        let mut results = Vec::new();
        for entry in partition.iter() {
            let (key, value) = entry.map_err(map_err)?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut fjall_batch = self.keyspace.batch();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    let partition = self.partition(*column)?;
                    fjall_batch.insert(partition, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    let partition = self.partition(*column)?;
                    fjall_batch.remove(partition, key.as_slice());
                }
            }
        }
        fjall_batch.commit().map_err(map_err)?;
        Ok(())
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_and_scan_match_memory_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path().join("db")).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(Column::Blocks, b"h1".to_vec(), b"blk".to_vec());
        batch.put(Column::Blocks, b"l".to_vec(), b"h1".to_vec());
        batch.put(Column::Utxo, b"t1".to_vec(), b"outs".to_vec());
        store.write_batch(&batch).unwrap();

        assert_eq!(store.get(Column::Blocks, b"l").unwrap(), Some(b"h1".to_vec()));
        assert_eq!(store.get(Column::Utxo, b"t1").unwrap(), Some(b"outs".to_vec()));

        store.delete(Column::Utxo, b"t1").unwrap();
        assert_eq!(store.get(Column::Utxo, b"t1").unwrap(), None);

        store.put(Column::Utxo, b"b", b"2").unwrap();
        store.put(Column::Utxo, b"a", b"1").unwrap();
        let keys: Vec<_> = store
            .scan(Column::Utxo)
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
