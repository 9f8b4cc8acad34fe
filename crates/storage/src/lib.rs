use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Logical tables of the index. Each backend maps a column to its own keyspace.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    Utxo,
    UtxoLookup,
    History,
    TxNumHash,
    TxHashNum,
    Header,
    Undo,
    Meta,
}

impl Column {
    pub const ALL: [Column; 8] = [
        Column::Utxo,
        Column::UtxoLookup,
        Column::History,
        Column::TxNumHash,
        Column::TxHashNum,
        Column::Header,
        Column::Undo,
        Column::Meta,
    ];

    pub const fn bit(self) -> u32 {
        match self {
            Column::Utxo => 1 << 0,
            Column::UtxoLookup => 1 << 1,
            Column::History => 1 << 2,
            Column::TxNumHash => 1 << 3,
            Column::TxHashNum => 1 << 4,
            Column::Header => 1 << 5,
            Column::Undo => 1 << 6,
            Column::Meta => 1 << 7,
        }
    }

    pub const fn index(self) -> usize {
        self.bit().trailing_zeros() as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Utxo => "utxo",
            Column::UtxoLookup => "utxo_lookup",
            Column::History => "history",
            Column::TxNumHash => "txnum_hash",
            Column::TxHashNum => "txhash_num",
            Column::Header => "header",
            Column::Undo => "undo",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 40]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteKey {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteKey {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteKey {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 96]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl AsRef<[u8]> for WriteValue {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteValue {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteValue {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteValue {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
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

    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key.as_slice(),
        }
    }
}

/// An ordered list of mutations committed atomically by [`KeyValueStore::write_batch`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.ops.reserve(additional);
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

    pub fn append(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
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

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Collapses repeated writes to the same key, keeping the last one.
    ///
    /// Engines are free to apply duplicate keys inside one batch in any order,
    /// so callers that may touch a key twice coalesce before committing.
    pub fn coalesce(self) -> WriteBatch {
        let mut latest: BTreeMap<(Column, Vec<u8>), WriteOp> = BTreeMap::new();
        for op in self.ops {
            latest.insert((op.column(), op.key().to_vec()), op);
        }
        WriteBatch {
            ops: latest.into_values().collect(),
        }
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    /// Visits keys in `[start, end)` in ascending order.
    fn for_each_range<'a>(
        &self,
        column: Column,
        start: &[u8],
        end: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
    /// Blocks until every committed batch is durable.
    fn persist(&self) -> Result<(), StoreError>;
    /// Read-only view of the store as of this call. Batches committed later
    /// are invisible to it, so a sequence of reads through one snapshot never
    /// sees half of a batch.
    fn snapshot(&self) -> Result<Snapshot, StoreError>;
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

    fn for_each_range<'a>(
        &self,
        column: Column,
        start: &[u8],
        end: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_range(column, start, end, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }

    fn persist(&self) -> Result<(), StoreError> {
        self.as_ref().persist()
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        self.as_ref().snapshot()
    }
}

/// Reads against a frozen point of one backend.
pub trait SnapshotRead: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn for_each_prefix(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError>;
    fn for_each_range(
        &self,
        column: Column,
        start: &[u8],
        end: &[u8],
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError>;
}

/// Point-in-time handle returned by [`KeyValueStore::snapshot`]. Cloning is
/// cheap and every clone reads the same frozen state. Writes are rejected.
#[derive(Clone)]
pub struct Snapshot {
    reader: Arc<dyn SnapshotRead>,
}

impl Snapshot {
    pub fn new(reader: impl SnapshotRead + 'static) -> Self {
        Self {
            reader: Arc::new(reader),
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").finish_non_exhaustive()
    }
}

fn read_only() -> StoreError {
    StoreError::Backend("snapshot is read-only".to_string())
}

impl KeyValueStore for Snapshot {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.reader.get(column, key)
    }

    fn put(&self, _column: Column, _key: &[u8], _value: &[u8]) -> Result<(), StoreError> {
        Err(read_only())
    }

    fn delete(&self, _column: Column, _key: &[u8]) -> Result<(), StoreError> {
        Err(read_only())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut results = Vec::new();
        self.reader.for_each_prefix(column, prefix, &mut |key, value| {
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
        self.reader.for_each_prefix(column, prefix, visitor)
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
        self.reader.for_each_range(column, start, end, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        Err(read_only())
    }

    fn persist(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self.clone())
    }
}
