//! Unspent outputs keyed by script, plus the outpoint lookup used to resolve inputs.

use hashxd_primitives::{HashX, OutPoint, HASHX_LEN};
use hashxd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::TxNum;

pub const UTXO_KEY_LEN: usize = HASHX_LEN + 8 + 4;
pub const LOOKUP_KEY_LEN: usize = 32 + 4;
const UTXO_VALUE_LEN: usize = 12;
const LOOKUP_VALUE_LEN: usize = HASHX_LEN + 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UtxoRecord {
    pub hashx: HashX,
    pub tx_num: TxNum,
    pub index: u32,
    pub value: i64,
    pub height: u32,
}

impl UtxoRecord {
    pub fn key(&self) -> [u8; UTXO_KEY_LEN] {
        utxo_key(&self.hashx, self.tx_num, self.index)
    }

    fn encode_value(&self) -> [u8; UTXO_VALUE_LEN] {
        let mut out = [0u8; UTXO_VALUE_LEN];
        out[0..8].copy_from_slice(&self.value.to_le_bytes());
        out[8..12].copy_from_slice(&self.height.to_le_bytes());
        out
    }

    fn decode_row(key: &[u8], value: &[u8]) -> Option<Self> {
        if key.len() != UTXO_KEY_LEN || value.len() != UTXO_VALUE_LEN {
            return None;
        }
        let hashx = HashX::from_slice(&key[0..HASHX_LEN])?;
        let tx_num = u64::from_be_bytes(key[HASHX_LEN..HASHX_LEN + 8].try_into().ok()?);
        let index = u32::from_be_bytes(key[HASHX_LEN + 8..].try_into().ok()?);
        let amount = i64::from_le_bytes(value[0..8].try_into().ok()?);
        let height = u32::from_le_bytes(value[8..12].try_into().ok()?);
        Some(Self {
            hashx,
            tx_num,
            index,
            value: amount,
            height,
        })
    }
}

pub fn utxo_key(hashx: &HashX, tx_num: TxNum, index: u32) -> [u8; UTXO_KEY_LEN] {
    let mut key = [0u8; UTXO_KEY_LEN];
    key[0..HASHX_LEN].copy_from_slice(hashx.as_bytes());
    key[HASHX_LEN..HASHX_LEN + 8].copy_from_slice(&tx_num.to_be_bytes());
    key[HASHX_LEN + 8..].copy_from_slice(&index.to_be_bytes());
    key
}

pub fn lookup_key(outpoint: &OutPoint) -> [u8; LOOKUP_KEY_LEN] {
    let mut key = [0u8; LOOKUP_KEY_LEN];
    key[0..32].copy_from_slice(&outpoint.txid);
    key[32..36].copy_from_slice(&outpoint.index.to_be_bytes());
    key
}

fn lookup_value(record: &UtxoRecord) -> [u8; LOOKUP_VALUE_LEN] {
    let mut out = [0u8; LOOKUP_VALUE_LEN];
    out[0..HASHX_LEN].copy_from_slice(record.hashx.as_bytes());
    out[HASHX_LEN..].copy_from_slice(&record.tx_num.to_le_bytes());
    out
}

#[derive(Clone)]
pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(
        &self,
        hashx: &HashX,
        tx_num: TxNum,
        index: u32,
    ) -> Result<Option<UtxoRecord>, StoreError> {
        let key = utxo_key(hashx, tx_num, index);
        match self.store.get(Column::Utxo, &key)? {
            Some(value) => UtxoRecord::decode_row(&key, &value)
                .ok_or_else(|| StoreError::Backend("invalid utxo entry".to_string()))
                .map(Some),
            None => Ok(None),
        }
    }

    /// Resolves an outpoint to its unspent entry, if any.
    pub fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, StoreError> {
        let Some(bytes) = self.store.get(Column::UtxoLookup, &lookup_key(outpoint))? else {
            return Ok(None);
        };
        if bytes.len() != LOOKUP_VALUE_LEN {
            return Err(StoreError::Backend("invalid utxo lookup entry".to_string()));
        }
        let hashx = HashX::from_slice(&bytes[0..HASHX_LEN])
            .ok_or_else(|| StoreError::Backend("invalid utxo lookup entry".to_string()))?;
        let mut tx_num = [0u8; 8];
        tx_num.copy_from_slice(&bytes[HASHX_LEN..]);
        match self.get(&hashx, u64::from_le_bytes(tx_num), outpoint.index)? {
            Some(record) => Ok(Some(record)),
            None => Err(StoreError::Backend(format!(
                "utxo lookup for {outpoint} points at a missing entry"
            ))),
        }
    }

    pub fn for_each<F>(&self, hashx: &HashX, mut visitor: F) -> Result<(), StoreError>
    where
        F: FnMut(UtxoRecord) -> Result<(), StoreError>,
    {
        self.store
            .for_each_prefix(Column::Utxo, hashx.as_bytes(), &mut |key, value| {
                let record = UtxoRecord::decode_row(key, value)
                    .ok_or_else(|| StoreError::Backend("invalid utxo entry".to_string()))?;
                visitor(record)
            })
    }

    pub fn insert(&self, batch: &mut WriteBatch, outpoint: &OutPoint, record: &UtxoRecord) {
        batch.put(Column::Utxo, record.key(), record.encode_value());
        batch.put(Column::UtxoLookup, lookup_key(outpoint), lookup_value(record));
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint, record: &UtxoRecord) {
        batch.delete(Column::Utxo, record.key());
        batch.delete(Column::UtxoLookup, lookup_key(outpoint));
    }
}
