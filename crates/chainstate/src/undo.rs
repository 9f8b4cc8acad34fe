use std::collections::BTreeSet;

use hashxd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use hashxd_primitives::outpoint::OutPoint;
use hashxd_primitives::{Hash256, HashX, HASHX_LEN};
use hashxd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::header::height_key;
use crate::utxo::UtxoRecord;
use crate::TxNum;

const BLOCK_UNDO_VERSION: u8 = 1;
const SPENT_ENTRY_LEN: usize = 36 + HASHX_LEN + 8 + 8 + 4;
const CREATED_OUTPUT_LEN: usize = 4 + HASHX_LEN;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentUtxo {
    pub outpoint: OutPoint,
    pub record: UtxoRecord,
}

/// Indexed outputs a transaction created; its tx number is implied by position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedTx {
    pub txid: Hash256,
    pub outputs: Vec<(u32, HashX)>,
}

/// Everything needed to take one block back out of the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockUndo {
    pub height: u32,
    pub block_hash: Hash256,
    pub prev_hash: Hash256,
    pub prev_tx_count: u64,
    /// Spent entries in the order the block consumed them.
    pub spent: Vec<SpentUtxo>,
    pub created: Vec<CreatedTx>,
}

impl BlockUndo {
    pub fn tx_nums(&self) -> impl Iterator<Item = (TxNum, &CreatedTx)> {
        self.created
            .iter()
            .enumerate()
            .map(|(offset, tx)| (self.prev_tx_count + offset as u64, tx))
    }

    pub fn touched(&self) -> BTreeSet<HashX> {
        let mut out = BTreeSet::new();
        for spent in &self.spent {
            out.insert(spent.record.hashx);
        }
        for tx in &self.created {
            out.extend(tx.outputs.iter().map(|(_, hashx)| *hashx));
        }
        out
    }

    pub fn item_count(&self) -> usize {
        self.spent.len()
            + self
                .created
                .iter()
                .map(|tx| tx.outputs.len().max(1))
                .sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_u32_le(self.height);
        encoder.write_hash_le(&self.block_hash);
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_u64_le(self.prev_tx_count);
        encoder.write_varint(self.spent.len() as u64);
        for spent in &self.spent {
            spent.outpoint.consensus_encode(&mut encoder);
            encoder.write_bytes(spent.record.hashx.as_bytes());
            encoder.write_u64_le(spent.record.tx_num);
            encoder.write_i64_le(spent.record.value);
            encoder.write_u32_le(spent.record.height);
        }
        encoder.write_varint(self.created.len() as u64);
        for tx in &self.created {
            encoder.write_hash_le(&tx.txid);
            encoder.write_varint(tx.outputs.len() as u64);
            for (index, hashx) in &tx.outputs {
                encoder.write_u32_le(*index);
                encoder.write_bytes(hashx.as_bytes());
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let height = decoder.read_u32_le()?;
        let block_hash = decoder.read_hash_le()?;
        let prev_hash = decoder.read_hash_le()?;
        let prev_tx_count = decoder.read_u64_le()?;

        let spent_count = decoder.read_count(SPENT_ENTRY_LEN)?;
        let mut spent = Vec::with_capacity(spent_count);
        for _ in 0..spent_count {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let hashx = HashX::from_bytes(decoder.read_fixed::<HASHX_LEN>()?);
            let tx_num = decoder.read_u64_le()?;
            let value = decoder.read_i64_le()?;
            let spent_height = decoder.read_u32_le()?;
            spent.push(SpentUtxo {
                outpoint,
                record: UtxoRecord {
                    hashx,
                    tx_num,
                    index: outpoint.index,
                    value,
                    height: spent_height,
                },
            });
        }

        let created_count = decoder.read_count(33)?;
        let mut created = Vec::with_capacity(created_count);
        for _ in 0..created_count {
            let txid = decoder.read_hash_le()?;
            let output_count = decoder.read_count(CREATED_OUTPUT_LEN)?;
            let mut outputs = Vec::with_capacity(output_count);
            for _ in 0..output_count {
                let index = decoder.read_u32_le()?;
                let hashx = HashX::from_bytes(decoder.read_fixed::<HASHX_LEN>()?);
                outputs.push((index, hashx));
            }
            created.push(CreatedTx { txid, outputs });
        }
        decoder.finish()?;

        Ok(Self {
            height,
            block_hash,
            prev_hash,
            prev_tx_count,
            spent,
            created,
        })
    }
}

#[derive(Clone)]
pub struct UndoLog<S> {
    store: S,
}

impl<S> UndoLog<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UndoLog<S> {
    pub fn put(&self, batch: &mut WriteBatch, undo: &BlockUndo) {
        batch.put(Column::Undo, height_key(undo.height), undo.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, height: u32) {
        batch.delete(Column::Undo, height_key(height));
    }

    pub fn get(&self, height: u32) -> Result<Option<BlockUndo>, StoreError> {
        let Some(bytes) = self.store.get(Column::Undo, &height_key(height))? else {
            return Ok(None);
        };
        BlockUndo::decode(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Backend(format!("invalid undo record at {height}: {err}")))
    }

    pub fn heights_from(&self, from: u32) -> Result<Vec<u32>, StoreError> {
        let mut out = Vec::new();
        self.store.for_each_range(
            Column::Undo,
            &height_key(from),
            &height_key(u32::MAX),
            &mut |key, _| {
                let raw: [u8; 4] = key
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid undo key".to_string()))?;
                out.push(u32::from_be_bytes(raw));
                Ok(())
            },
        )?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_record_survives_encoding() {
        let hashx = HashX::from_bytes([9u8; HASHX_LEN]);
        let undo = BlockUndo {
            height: 98,
            block_hash: [1u8; 32],
            prev_hash: [2u8; 32],
            prev_tx_count: 400,
            spent: vec![SpentUtxo {
                outpoint: OutPoint::new([3u8; 32], 2),
                record: UtxoRecord {
                    hashx,
                    tx_num: 17,
                    index: 2,
                    value: 5_000,
                    height: 40,
                },
            }],
            created: vec![
                CreatedTx {
                    txid: [4u8; 32],
                    outputs: vec![(0, hashx)],
                },
                CreatedTx {
                    txid: [5u8; 32],
                    outputs: Vec::new(),
                },
            ],
        };
        let decoded = BlockUndo::decode(&undo.encode()).expect("decode undo");
        assert_eq!(decoded, undo);
        let nums: Vec<TxNum> = decoded.tx_nums().map(|(num, _)| num).collect();
        assert_eq!(nums, vec![400, 401]);
        assert_eq!(decoded.touched().len(), 1);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = BlockUndo {
            height: 0,
            block_hash: [0u8; 32],
            prev_hash: [0u8; 32],
            prev_tx_count: 0,
            spent: Vec::new(),
            created: Vec::new(),
        }
        .encode();
        bytes[0] = 7;
        assert!(BlockUndo::decode(&bytes).is_err());
    }
}
