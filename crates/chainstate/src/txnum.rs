//! Bidirectional map between tx numbers and txids.

use hashxd_primitives::Hash256;
use hashxd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::TxNum;

#[derive(Clone)]
pub struct TxNumIndex<S> {
    store: S,
}

impl<S> TxNumIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TxNumIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, tx_num: TxNum, txid: &Hash256) {
        batch.put(Column::TxNumHash, tx_num.to_be_bytes(), txid);
        batch.put(Column::TxHashNum, txid, tx_num.to_be_bytes());
    }

    pub fn delete(&self, batch: &mut WriteBatch, tx_num: TxNum, txid: &Hash256) {
        batch.delete(Column::TxNumHash, tx_num.to_be_bytes());
        batch.delete(Column::TxHashNum, txid);
    }

    pub fn txid(&self, tx_num: TxNum) -> Result<Option<Hash256>, StoreError> {
        let Some(bytes) = self.store.get(Column::TxNumHash, &tx_num.to_be_bytes())? else {
            return Ok(None);
        };
        let txid: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid tx number entry".to_string()))?;
        Ok(Some(txid))
    }

    pub fn tx_num(&self, txid: &Hash256) -> Result<Option<TxNum>, StoreError> {
        let Some(bytes) = self.store.get(Column::TxHashNum, txid)? else {
            return Ok(None);
        };
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid tx hash entry".to_string()))?;
        Ok(Some(u64::from_be_bytes(raw)))
    }

    /// Every `(tx_num, txid)` pair at or above `from`, ascending.
    pub fn from(&self, from: TxNum) -> Result<Vec<(TxNum, Hash256)>, StoreError> {
        let mut out = Vec::new();
        self.store.for_each_range(
            Column::TxNumHash,
            &from.to_be_bytes(),
            &TxNum::MAX.to_be_bytes(),
            &mut |key, value| {
                let num: [u8; 8] = key
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid tx number key".to_string()))?;
                let txid: Hash256 = value
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid tx number entry".to_string()))?;
                out.push((u64::from_be_bytes(num), txid));
                Ok(())
            },
        )?;
        Ok(out)
    }
}
