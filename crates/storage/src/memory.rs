use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    Column, KeyValueStore, PrefixVisitor, ScanResult, Snapshot, SnapshotRead, StoreError,
    WriteBatch, WriteOp,
};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Ordered in-memory backend. Batches apply under a single write lock, so
/// readers observe either none or all of a batch.
///
/// The map is shared copy-on-write: a snapshot keeps the current map alive
/// and the next write clones it once.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Arc<MemoryStoreMap>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `write_batch` fail without applying anything.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every key/value pair of one column, in key order.
    pub fn dump(&self, column: Column) -> Result<ScanResult, StoreError> {
        self.scan_prefix(column, &[])
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Arc<MemoryStoreMap>>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Arc<MemoryStoreMap>>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.read()?;
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        Arc::make_mut(&mut *guard).insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        Arc::make_mut(&mut *guard).remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut results = Vec::new();
        self.for_each_prefix(column, prefix, &mut |key, value| {
            results.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        visit_prefix(&guard, column, prefix, visitor)
    }

    fn for_each_range<'a>(
        &self,
        column: Column,
        start: &[u8],
        end: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        visit_range(&guard, column, start, end, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        let mut guard = self.write()?;
        let map = Arc::make_mut(&mut *guard);
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    map.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    map.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let guard = self.read()?;
        Ok(Snapshot::new(MemorySnapshot {
            map: Arc::clone(&*guard),
        }))
    }
}

struct MemorySnapshot {
    map: Arc<MemoryStoreMap>,
}

impl SnapshotRead for MemorySnapshot {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.get(&(column, key.to_vec())).cloned())
    }

    fn for_each_prefix(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError> {
        visit_prefix(&self.map, column, prefix, visitor)
    }

    fn for_each_range(
        &self,
        column: Column,
        start: &[u8],
        end: &[u8],
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError> {
        visit_range(&self.map, column, start, end, visitor)
    }
}

fn visit_prefix(
    map: &MemoryStoreMap,
    column: Column,
    prefix: &[u8],
    visitor: &mut PrefixVisitor<'_>,
) -> Result<(), StoreError> {
    let start = (column, prefix.to_vec());
    for ((entry_column, key), value) in map.range(start..) {
        if *entry_column != column || !key.starts_with(prefix) {
            break;
        }
        visitor(key.as_slice(), value.as_slice())?;
    }
    Ok(())
}

fn visit_range(
    map: &MemoryStoreMap,
    column: Column,
    start: &[u8],
    end: &[u8],
    visitor: &mut PrefixVisitor<'_>,
) -> Result<(), StoreError> {
    if start >= end {
        return Ok(());
    }
    let bounds = (
        Bound::Included((column, start.to_vec())),
        Bound::Excluded((column, end.to_vec())),
    );
    for ((_, key), value) in map.range(bounds) {
        visitor(key.as_slice(), value.as_slice())?;
    }
    Ok(())
}
