//! The chain state store: index schema over a [`KeyValueStore`] with atomic
//! multi-table commits. The flush state row is the last write of every batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hashxd_log::{log_info, log_warn};
use hashxd_primitives::{hash256_to_hex, Hash256, HashX, OutPoint};
use hashxd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;
use crate::flush::{FlushState, FLUSH_STATE_KEY};
use crate::header::{HeaderChain, HeaderRecord};
use crate::history::HistoryIndex;
use crate::txnum::TxNumIndex;
use crate::undo::{BlockUndo, UndoLog};
use crate::utxo::{UtxoRecord, UtxoSet};
use crate::view::ChainView;
use crate::TxNum;

/// One commit worth of index changes, covering consecutive blocks.
#[derive(Default)]
pub struct ChainBatch {
    pub creates: Vec<(OutPoint, UtxoRecord)>,
    pub spends: Vec<(OutPoint, UtxoRecord)>,
    pub history: BTreeMap<HashX, Vec<TxNum>>,
    /// Txids in tx-number order, continuing the committed count.
    pub tx_hashes: Vec<Hash256>,
    pub headers: Vec<HeaderRecord>,
    pub undos: Vec<BlockUndo>,
}

impl ChainBatch {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.tx_hashes.is_empty()
            && self.creates.is_empty()
            && self.spends.is_empty()
            && self.history.is_empty()
    }
}

pub(crate) fn read_flush_state<S: KeyValueStore>(store: &S) -> Result<FlushState, ChainStateError> {
    match store.get(Column::Meta, FLUSH_STATE_KEY)? {
        Some(bytes) => Ok(FlushState::decode(&bytes)?),
        None => Ok(FlushState::empty()),
    }
}

pub struct ChainStore<S> {
    store: Arc<S>,
    utxos: UtxoSet<Arc<S>>,
    history: HistoryIndex<Arc<S>>,
    tx_nums: TxNumIndex<Arc<S>>,
    headers: HeaderChain<Arc<S>>,
    undo: UndoLog<Arc<S>>,
    state: FlushState,
    undo_retention: u32,
}

impl<S: KeyValueStore> ChainStore<S> {
    /// Opens the index at its last committed flush state, discarding anything
    /// found beyond it.
    pub fn open(store: Arc<S>, undo_retention: u32) -> Result<Self, ChainStateError> {
        let state = read_flush_state(store.as_ref())?;
        let chain = Self {
            utxos: UtxoSet::new(Arc::clone(&store)),
            history: HistoryIndex::new(Arc::clone(&store)),
            tx_nums: TxNumIndex::new(Arc::clone(&store)),
            headers: HeaderChain::new(Arc::clone(&store)),
            undo: UndoLog::new(Arc::clone(&store)),
            store,
            state,
            undo_retention,
        };
        chain.verify_tip()?;
        chain.discard_uncommitted()?;
        Ok(chain)
    }

    fn verify_tip(&self) -> Result<(), ChainStateError> {
        let Ok(height) = u32::try_from(self.state.height) else {
            return Ok(());
        };
        match self.headers.get(height)? {
            Some(record) if record.hash == self.state.tip && record.tx_count == self.state.tx_count => {
                Ok(())
            }
            Some(record) => Err(ChainStateError::Consistency(format!(
                "flush state tip {} (tx count {}) does not match stored header {} (tx count {}) at height {height}",
                hash256_to_hex(&self.state.tip),
                self.state.tx_count,
                hash256_to_hex(&record.hash),
                record.tx_count,
            ))),
            None => Err(ChainStateError::Consistency(format!(
                "flush state height {height} has no stored header"
            ))),
        }
    }

    fn discard_uncommitted(&self) -> Result<(), ChainStateError> {
        let first_height = (self.state.height + 1) as u32;
        let stale_headers = self.headers.heights_from(first_height)?;
        let stale_undo = self.undo.heights_from(first_height)?;
        let stale_txs = self.tx_nums.from(self.state.tx_count)?;
        if stale_headers.is_empty() && stale_undo.is_empty() && stale_txs.is_empty() {
            return Ok(());
        }
        log_warn!(
            "discarding {} headers, {} undo records and {} tx numbers beyond committed height {}",
            stale_headers.len(),
            stale_undo.len(),
            stale_txs.len(),
            self.state.height
        );
        let mut batch = WriteBatch::new();
        for height in stale_headers {
            self.headers.delete(&mut batch, height);
        }
        for height in stale_undo {
            self.undo.delete(&mut batch, height);
        }
        for (tx_num, txid) in stale_txs {
            self.tx_nums.delete(&mut batch, tx_num, &txid);
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn state(&self) -> &FlushState {
        &self.state
    }

    pub fn view(&self) -> ChainView<S> {
        ChainView::new(Arc::clone(&self.store))
    }

    pub fn get_utxo(
        &self,
        hashx: &HashX,
        tx_num: TxNum,
        index: u32,
    ) -> Result<Option<UtxoRecord>, ChainStateError> {
        Ok(self.utxos.get(hashx, tx_num, index)?)
    }

    pub fn lookup_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, ChainStateError> {
        Ok(self.utxos.lookup(outpoint)?)
    }

    pub fn header(&self, height: u32) -> Result<Option<HeaderRecord>, ChainStateError> {
        Ok(self.headers.get(height)?)
    }

    /// Commits a batch atomically and returns the new committed height.
    pub fn apply_batch(
        &mut self,
        batch: ChainBatch,
        first_sync: bool,
    ) -> Result<i32, ChainStateError> {
        let prev = self.state.clone();
        let Some(last) = batch.headers.last() else {
            if batch.is_empty() {
                return Ok(prev.height);
            }
            return Err(ChainStateError::Consistency(
                "batch carries index changes without a block".to_string(),
            ));
        };
        if batch.headers[0].header.prev_block != prev.tip {
            return Err(ChainStateError::Consistency(format!(
                "batch starts at block {} whose parent is not the committed tip {}",
                hash256_to_hex(&batch.headers[0].hash),
                hash256_to_hex(&prev.tip)
            )));
        }
        for pair in batch.headers.windows(2) {
            if pair[1].header.prev_block != pair[0].hash {
                return Err(ChainStateError::Consistency(format!(
                    "batch block {} does not extend {}",
                    hash256_to_hex(&pair[1].hash),
                    hash256_to_hex(&pair[0].hash)
                )));
            }
        }
        let new_tx_count = prev.tx_count + batch.tx_hashes.len() as u64;
        if last.tx_count != new_tx_count {
            return Err(ChainStateError::Consistency(format!(
                "tip header records {} transactions but the batch ends at {new_tx_count}",
                last.tx_count
            )));
        }

        let first_height = (prev.height + 1) as u32;
        let new_height = first_height + batch.headers.len() as u32 - 1;
        let keep_undo_from = (new_height + 1).saturating_sub(self.undo_retention);
        let prev_keep_from = first_height.saturating_sub(self.undo_retention);

        let mut wb = WriteBatch::new();
        wb.reserve(
            batch.spends.len() * 2
                + batch.creates.len() * 2
                + batch.tx_hashes.len() * 2
                + batch.headers.len() * 2
                + batch.history.len()
                + 1,
        );
        for (outpoint, record) in &batch.spends {
            self.utxos.delete(&mut wb, outpoint, record);
        }
        for (outpoint, record) in &batch.creates {
            self.utxos.insert(&mut wb, outpoint, record);
        }
        for (hashx, tx_nums) in &batch.history {
            for tx_num in tx_nums {
                self.history.append(&mut wb, hashx, *tx_num);
            }
        }
        for (offset, txid) in batch.tx_hashes.iter().enumerate() {
            self.tx_nums.insert(&mut wb, prev.tx_count + offset as u64, txid);
        }
        for (offset, record) in batch.headers.iter().enumerate() {
            self.headers.put(&mut wb, first_height + offset as u32, record);
        }
        for undo in &batch.undos {
            let Some(record) = undo
                .height
                .checked_sub(first_height)
                .and_then(|offset| batch.headers.get(offset as usize))
            else {
                return Err(ChainStateError::Consistency(format!(
                    "undo record for height {} lies outside the batch",
                    undo.height
                )));
            };
            if record.hash != undo.block_hash {
                return Err(ChainStateError::Consistency(format!(
                    "undo record for height {} belongs to a different block",
                    undo.height
                )));
            }
            if undo.height >= keep_undo_from {
                self.undo.put(&mut wb, undo);
            }
        }
        for height in prev_keep_from..keep_undo_from.min(first_height) {
            self.undo.delete(&mut wb, height);
        }

        let state = prev.advanced(new_height as i32, last.hash, new_tx_count, first_sync);
        wb.put(Column::Meta, FLUSH_STATE_KEY, state.encode());
        self.store.write_batch(&wb)?;
        self.state = state;
        Ok(self.state.height)
    }

    /// Takes every block above `height` back out of the index in one atomic
    /// batch, returning the consumed undo records from the tip downwards.
    ///
    /// All undo records are read and checked before anything is written, so a
    /// missing record leaves the store untouched.
    pub fn rewind_to(&mut self, height: i32) -> Result<Vec<BlockUndo>, ChainStateError> {
        let prev = self.state.clone();
        if height >= prev.height {
            return Ok(Vec::new());
        }
        if height < -1 {
            return Err(ChainStateError::Consistency(format!(
                "cannot rewind to height {height}"
            )));
        }

        let mut undos = Vec::with_capacity((prev.height - height) as usize);
        let mut expected_hash = prev.tip;
        let mut expected_tx_count = prev.tx_count;
        for block_height in ((height + 1) as u32..=prev.height as u32).rev() {
            let undo = self
                .undo
                .get(block_height)?
                .ok_or(ChainStateError::MissingUndo(block_height))?;
            if undo.height != block_height
                || undo.block_hash != expected_hash
                || undo.prev_tx_count + undo.created.len() as u64 != expected_tx_count
            {
                return Err(ChainStateError::Consistency(format!(
                    "undo record at height {block_height} does not match the indexed block"
                )));
            }
            expected_hash = undo.prev_hash;
            expected_tx_count = undo.prev_tx_count;
            undos.push(undo);
        }
        if let Ok(target) = u32::try_from(height) {
            match self.headers.get(target)? {
                Some(record) if record.hash == expected_hash && record.tx_count == expected_tx_count => {}
                _ => {
                    return Err(ChainStateError::Consistency(format!(
                        "rewind target {height} does not match the parent recorded in undo data"
                    )))
                }
            }
        }

        let mut wb = WriteBatch::new();
        let mut touched = BTreeSet::new();
        for undo in &undos {
            for spent in undo.spent.iter().rev() {
                self.utxos.insert(&mut wb, &spent.outpoint, &spent.record);
                touched.insert(spent.record.hashx);
            }
            for (tx_num, created) in undo.tx_nums() {
                for (index, hashx) in &created.outputs {
                    let record = UtxoRecord {
                        hashx: *hashx,
                        tx_num,
                        index: *index,
                        value: 0,
                        height: undo.height,
                    };
                    self.utxos
                        .delete(&mut wb, &OutPoint::new(created.txid, *index), &record);
                    touched.insert(*hashx);
                }
                self.tx_nums.delete(&mut wb, tx_num, &created.txid);
            }
            self.headers.delete(&mut wb, undo.height);
            self.undo.delete(&mut wb, undo.height);
        }
        for hashx in &touched {
            for tx_num in self.history.from(hashx, expected_tx_count)? {
                self.history.delete(&mut wb, hashx, tx_num);
            }
        }

        let state = prev.advanced(height, expected_hash, expected_tx_count, prev.first_sync);
        wb.put(Column::Meta, FLUSH_STATE_KEY, state.encode());
        let wb = wb.coalesce();
        self.store.write_batch(&wb)?;
        log_info!(
            "rewound {} block(s) to height {height} ({} scripts touched)",
            undos.len(),
            touched.len()
        );
        self.state = state;
        Ok(undos)
    }

    /// Makes every committed batch durable.
    pub fn flush(&self) -> Result<(), ChainStateError> {
        self.store.persist()?;
        Ok(())
    }
}
