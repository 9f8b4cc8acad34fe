//! Per-script confirmed history: one empty-valued row per (script, tx number).

use hashxd_primitives::{HashX, HASHX_LEN};
use hashxd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::TxNum;

pub const HISTORY_KEY_LEN: usize = HASHX_LEN + 8;

pub fn history_key(hashx: &HashX, tx_num: TxNum) -> [u8; HISTORY_KEY_LEN] {
    let mut key = [0u8; HISTORY_KEY_LEN];
    key[0..HASHX_LEN].copy_from_slice(hashx.as_bytes());
    key[HASHX_LEN..].copy_from_slice(&tx_num.to_be_bytes());
    key
}

fn tx_num_from_key(key: &[u8]) -> Result<TxNum, StoreError> {
    if key.len() != HISTORY_KEY_LEN {
        return Err(StoreError::Backend("invalid history key".to_string()));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&key[HASHX_LEN..]);
    Ok(u64::from_be_bytes(raw))
}

#[derive(Clone)]
pub struct HistoryIndex<S> {
    store: S,
}

impl<S> HistoryIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> HistoryIndex<S> {
    pub fn append(&self, batch: &mut WriteBatch, hashx: &HashX, tx_num: TxNum) {
        batch.put(Column::History, history_key(hashx, tx_num), [0u8; 0]);
    }

    pub fn delete(&self, batch: &mut WriteBatch, hashx: &HashX, tx_num: TxNum) {
        batch.delete(Column::History, history_key(hashx, tx_num));
    }

    /// Tx numbers in `[from, to)` touching `hashx`, ascending.
    pub fn range(&self, hashx: &HashX, from: TxNum, to: TxNum) -> Result<Vec<TxNum>, StoreError> {
        let start = history_key(hashx, from);
        let end = history_key(hashx, to);
        let mut out = Vec::new();
        self.store
            .for_each_range(Column::History, &start, &end, &mut |key, _| {
                out.push(tx_num_from_key(key)?);
                Ok(())
            })?;
        Ok(out)
    }

    pub fn below(&self, hashx: &HashX, tx_count: TxNum) -> Result<Vec<TxNum>, StoreError> {
        self.range(hashx, 0, tx_count)
    }

    pub fn from(&self, hashx: &HashX, tx_num: TxNum) -> Result<Vec<TxNum>, StoreError> {
        self.range(hashx, tx_num, TxNum::MAX)
    }
}
