use std::path::Path;
use std::time::{Duration, Instant};

use fjall::{
    Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode,
    Snapshot as PartitionSnapshot,
};
use hashxd_log::RateLimit;

use crate::{
    Column, KeyValueStore, PrefixVisitor, ScanResult, Snapshot, SnapshotRead, StoreError,
    WriteBatch, WriteOp,
};

const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_millis(500);
const SLOW_PERSIST_THRESHOLD: Duration = Duration::from_secs(2);

static SLOW_COMMIT_LOG: RateLimit = RateLimit::new(30_000);

/// LSM-tree backend: one fjall partition per [`Column`], batches committed
/// through a single cross-partition fjall batch.
pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
}

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub write_buffer_bytes: Option<u64>,
    pub journal_bytes: Option<u64>,
    pub memtable_bytes: Option<u32>,
    pub fsync_ms: Option<u16>,
}

impl FjallOptions {
    fn apply_config(&self, mut config: Config) -> Config {
        if let Some(bytes) = self.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = self.write_buffer_bytes {
            config = config.max_write_buffer_size(bytes);
        }
        if let Some(bytes) = self.journal_bytes {
            config = config.max_journaling_size(bytes);
        }
        if let Some(ms) = self.fsync_ms {
            config = config.fsync_ms(Some(ms));
        }
        config
    }

    fn partition_options(&self) -> PartitionCreateOptions {
        let mut options = PartitionCreateOptions::default();
        if let Some(bytes) = self.memtable_bytes {
            options = options.max_memtable_size(bytes);
        }
        options
    }
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let keyspace = options
            .apply_config(Config::new(path))
            .open()
            .map_err(map_err)?;
        let partition_options = options.partition_options();
        let mut partitions = Vec::with_capacity(Column::ALL.len());
        for column in Column::ALL {
            let handle = keyspace
                .open_partition(column.as_str(), partition_options.clone())
                .map_err(map_err)?;
            partitions.push(handle);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(column.index())
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

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let partition = self.partition(column)?;
        let mut results = Vec::new();
        for entry in partition.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        for entry in partition.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn for_each_range<'a>(
        &self,
        column: Column,
        start: &[u8],
        end: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        if start >= end {
            return Ok(());
        }
        let partition = self.partition(column)?;
        for entry in partition.range(start.to_vec()..end.to_vec()) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut fjall_batch = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(PersistMode::Buffer));
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
        let commit_start = Instant::now();
        fjall_batch.commit().map_err(map_err)?;
        let elapsed = commit_start.elapsed();
        if elapsed >= SLOW_COMMIT_THRESHOLD && SLOW_COMMIT_LOG.allow() {
            hashxd_log::log_warn!(
                "fjall batch commit took {}ms (ops {}, write_buffer {}B, journals {})",
                elapsed.as_millis(),
                batch.len(),
                self.keyspace.write_buffer_size(),
                self.keyspace.journal_count(),
            );
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        let start = Instant::now();
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(map_err)?;
        let elapsed = start.elapsed();
        if elapsed >= SLOW_PERSIST_THRESHOLD {
            hashxd_log::log_warn!("fjall persist took {}ms", elapsed.as_millis());
        }
        Ok(())
    }

    /// Pins every partition at the same keyspace sequence number. A batch
    /// commits under one sequence number, so it is either fully before the
    /// instant or fully after it.
    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let instant = self.keyspace.instant();
        let partitions = self
            .partitions
            .iter()
            .map(|partition| partition.snapshot_at(instant))
            .collect();
        Ok(Snapshot::new(FjallSnapshot { partitions }))
    }
}

struct FjallSnapshot {
    partitions: Vec<PartitionSnapshot>,
}

impl FjallSnapshot {
    fn partition(&self, column: Column) -> Result<&PartitionSnapshot, StoreError> {
        self.partitions
            .get(column.index())
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }
}

impl SnapshotRead for FjallSnapshot {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(|err| map_err(err.into()))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn for_each_prefix(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError> {
        for entry in self.partition(column)?.prefix(prefix) {
            let (key, value) = entry.map_err(|err| map_err(err.into()))?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn for_each_range(
        &self,
        column: Column,
        start: &[u8],
        end: &[u8],
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError> {
        for entry in self.partition(column)?.range(start.to_vec()..end.to_vec()) {
            let (key, value) = entry.map_err(|err| map_err(err.into()))?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
