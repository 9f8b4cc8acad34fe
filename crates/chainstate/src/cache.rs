//! Writer-owned write-back cache holding everything applied since the last flush.
//!
//! Readers never see this structure; they read committed state through
//! [`crate::ChainView`] only.

use std::collections::{BTreeMap, HashMap, HashSet};

use hashxd_primitives::{Hash256, HashX, OutPoint};

use crate::header::HeaderRecord;
use crate::store::ChainBatch;
use crate::undo::BlockUndo;
use crate::utxo::UtxoRecord;
use crate::TxNum;

const CACHED_UTXO_BYTES: usize = 96;
const STORE_DELETE_BYTES: usize = 64;
const HISTORY_ENTRY_BYTES: usize = 16;
const TX_HASH_BYTES: usize = 32;
const HEADER_BYTES: usize = 96;
const UNDO_SPENT_BYTES: usize = 56;
const UNDO_CREATED_BYTES: usize = 48;

#[derive(Default)]
pub struct WriteCache {
    /// Outputs created since the last flush and not yet spent.
    utxos: HashMap<OutPoint, UtxoRecord>,
    /// Committed outputs spent since the last flush.
    spends: HashMap<OutPoint, UtxoRecord>,
    history: BTreeMap<HashX, Vec<TxNum>>,
    history_len: usize,
    tx_hashes: Vec<Hash256>,
    headers: Vec<HeaderRecord>,
    undos: Vec<BlockUndo>,
    undo_items: usize,
    touched: HashSet<HashX>,
}

impl WriteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_utxo(&mut self, outpoint: OutPoint, record: UtxoRecord) {
        self.utxos.insert(outpoint, record);
        self.touched.insert(record.hashx);
    }

    /// Removes and returns an output created since the last flush.
    pub fn take_utxo(&mut self, outpoint: &OutPoint) -> Option<UtxoRecord> {
        self.utxos.remove(outpoint)
    }

    pub fn spent_committed(&self, outpoint: &OutPoint) -> bool {
        self.spends.contains_key(outpoint)
    }

    pub fn record_committed_spend(&mut self, outpoint: OutPoint, record: UtxoRecord) {
        self.touched.insert(record.hashx);
        self.spends.insert(outpoint, record);
    }

    pub fn add_history(&mut self, hashx: HashX, tx_num: TxNum) {
        self.history.entry(hashx).or_default().push(tx_num);
        self.history_len += 1;
        self.touched.insert(hashx);
    }

    pub fn push_tx(&mut self, txid: Hash256) {
        self.tx_hashes.push(txid);
    }

    pub fn push_header(&mut self, record: HeaderRecord) {
        self.headers.push(record);
    }

    pub fn push_undo(&mut self, undo: BlockUndo) {
        self.undo_items += undo.item_count();
        self.undos.push(undo);
    }

    /// Header `offset` blocks above the committed tip, starting at zero.
    pub fn header(&self, offset: usize) -> Option<&HeaderRecord> {
        self.headers.get(offset)
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.tx_hashes.is_empty()
            && self.utxos.is_empty()
            && self.spends.is_empty()
    }

    pub fn pending_items(&self) -> usize {
        self.utxos.len()
            + self.spends.len()
            + self.history_len
            + self.tx_hashes.len()
            + self.headers.len()
            + self.undo_items
    }

    pub fn estimated_bytes(&self) -> usize {
        self.utxos.len() * CACHED_UTXO_BYTES
            + self.spends.len() * STORE_DELETE_BYTES
            + self.history_len * HISTORY_ENTRY_BYTES
            + self.tx_hashes.len() * TX_HASH_BYTES
            + self.headers.len() * HEADER_BYTES
            + self
                .undos
                .iter()
                .map(|undo| {
                    undo.spent.len() * UNDO_SPENT_BYTES
                        + undo.created.len() * UNDO_CREATED_BYTES
                })
                .sum::<usize>()
    }

    /// Drains the cache into a committable batch plus the scripts it touched.
    pub fn into_batch(self) -> (ChainBatch, HashSet<HashX>) {
        let batch = ChainBatch {
            creates: self.utxos.into_iter().collect(),
            spends: self.spends.into_iter().collect(),
            history: self.history,
            tx_hashes: self.tx_hashes,
            headers: self.headers,
            undos: self.undos,
        };
        (batch, self.touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashxd_primitives::HASHX_LEN;

    fn record(tag: u8, tx_num: TxNum) -> UtxoRecord {
        UtxoRecord {
            hashx: HashX::from_bytes([tag; HASHX_LEN]),
            tx_num,
            index: 0,
            value: 1_000,
            height: 1,
        }
    }

    #[test]
    fn output_spent_inside_the_window_never_reaches_the_batch() {
        let mut cache = WriteCache::new();
        let outpoint = OutPoint::new([1u8; 32], 0);
        cache.add_utxo(outpoint, record(1, 0));
        assert_eq!(cache.take_utxo(&outpoint), Some(record(1, 0)));
        assert_eq!(cache.take_utxo(&outpoint), None);

        let (batch, touched) = cache.into_batch();
        assert!(batch.creates.is_empty());
        assert!(batch.spends.is_empty());
        assert!(touched.contains(&HashX::from_bytes([1u8; HASHX_LEN])));
    }

    #[test]
    fn estimate_grows_with_pending_work() {
        let mut cache = WriteCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.estimated_bytes(), 0);
        cache.add_utxo(OutPoint::new([2u8; 32], 0), record(2, 5));
        cache.add_history(HashX::from_bytes([2u8; HASHX_LEN]), 5);
        cache.push_tx([2u8; 32]);
        assert_eq!(cache.pending_items(), 3);
        assert_eq!(
            cache.estimated_bytes(),
            CACHED_UTXO_BYTES + HISTORY_ENTRY_BYTES + TX_HASH_BYTES
        );
        cache.record_committed_spend(OutPoint::new([3u8; 32], 1), record(3, 1));
        assert!(cache.spent_committed(&OutPoint::new([3u8; 32], 1)));
    }
}
