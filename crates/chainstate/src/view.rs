//! Read-only access to committed state, safe to use from any number of
//! reader tasks while the writer runs.
//!
//! Rows keyed by a tx number at or above the committed count are ignored, so
//! readers never observe work the flush state does not yet cover. A query
//! that makes several reads takes one [`ChainSnapshot`] and makes them all
//! through it, so a flush or rewind committing in between cannot mix two
//! states into one answer.

use std::sync::Arc;

use hashxd_primitives::{Hash256, HashX, OutPoint};
use hashxd_storage::{KeyValueStore, Snapshot};

use crate::error::ChainStateError;
use crate::flush::FlushState;
use crate::header::{HeaderChain, HeaderRecord};
use crate::history::HistoryIndex;
use crate::store::read_flush_state;
use crate::txnum::TxNumIndex;
use crate::utxo::{UtxoRecord, UtxoSet};
use crate::TxNum;

pub struct ChainView<S> {
    store: Arc<S>,
}

impl<S> Clone for ChainView<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore> ChainView<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Pins the committed state as of now.
    pub fn snapshot(&self) -> Result<ChainSnapshot, ChainStateError> {
        ChainSnapshot::new(self.store.snapshot()?)
    }

    pub fn flush_state(&self) -> Result<FlushState, ChainStateError> {
        read_flush_state(self.store.as_ref())
    }

    pub fn height(&self) -> Result<i32, ChainStateError> {
        Ok(self.flush_state()?.height)
    }

    pub fn header(&self, height: u32) -> Result<Option<HeaderRecord>, ChainStateError> {
        self.snapshot()?.header(height)
    }

    pub fn block_hash(&self, height: u32) -> Result<Option<Hash256>, ChainStateError> {
        self.snapshot()?.block_hash(height)
    }

    pub fn balance(&self, hashx: &HashX) -> Result<i64, ChainStateError> {
        self.snapshot()?.balance(hashx)
    }

    pub fn utxos(&self, hashx: &HashX) -> Result<Vec<UtxoRecord>, ChainStateError> {
        self.snapshot()?.utxos(hashx)
    }

    pub fn history(&self, hashx: &HashX) -> Result<Vec<TxNum>, ChainStateError> {
        self.snapshot()?.history(hashx)
    }

    pub fn tx_num(&self, txid: &Hash256) -> Result<Option<TxNum>, ChainStateError> {
        self.snapshot()?.tx_num(txid)
    }

    pub fn tx_hash(&self, tx_num: TxNum) -> Result<Option<Hash256>, ChainStateError> {
        self.snapshot()?.tx_hash(tx_num)
    }

    pub fn tx_height(&self, tx_num: TxNum) -> Result<Option<u32>, ChainStateError> {
        self.snapshot()?.tx_height(tx_num)
    }

    pub fn lookup_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, ChainStateError> {
        self.snapshot()?.lookup_utxo(outpoint)
    }
}

/// Committed state frozen at one store snapshot.
#[derive(Clone)]
pub struct ChainSnapshot {
    state: FlushState,
    utxos: UtxoSet<Snapshot>,
    history: HistoryIndex<Snapshot>,
    tx_nums: TxNumIndex<Snapshot>,
    headers: HeaderChain<Snapshot>,
}

impl ChainSnapshot {
    fn new(snapshot: Snapshot) -> Result<Self, ChainStateError> {
        let state = read_flush_state(&snapshot)?;
        Ok(Self {
            state,
            utxos: UtxoSet::new(snapshot.clone()),
            history: HistoryIndex::new(snapshot.clone()),
            tx_nums: TxNumIndex::new(snapshot.clone()),
            headers: HeaderChain::new(snapshot),
        })
    }

    pub fn flush_state(&self) -> &FlushState {
        &self.state
    }

    pub fn height(&self) -> i32 {
        self.state.height
    }

    pub fn header(&self, height: u32) -> Result<Option<HeaderRecord>, ChainStateError> {
        if i64::from(height) > i64::from(self.state.height) {
            return Ok(None);
        }
        Ok(self.headers.get(height)?)
    }

    pub fn block_hash(&self, height: u32) -> Result<Option<Hash256>, ChainStateError> {
        Ok(self.header(height)?.map(|record| record.hash))
    }

    /// Confirmed balance, summed from the unspent entries.
    pub fn balance(&self, hashx: &HashX) -> Result<i64, ChainStateError> {
        Ok(self.utxos(hashx)?.iter().map(|utxo| utxo.value).sum())
    }

    /// Unspent entries of `hashx` in chain order.
    pub fn utxos(&self, hashx: &HashX) -> Result<Vec<UtxoRecord>, ChainStateError> {
        let tx_count = self.state.tx_count;
        let mut out = Vec::new();
        self.utxos.for_each(hashx, |record| {
            if record.tx_num < tx_count {
                out.push(record);
            }
            Ok(())
        })?;
        Ok(out)
    }

    pub fn history(&self, hashx: &HashX) -> Result<Vec<TxNum>, ChainStateError> {
        Ok(self.history.below(hashx, self.state.tx_count)?)
    }

    pub fn tx_num(&self, txid: &Hash256) -> Result<Option<TxNum>, ChainStateError> {
        let tx_count = self.state.tx_count;
        Ok(self.tx_nums.tx_num(txid)?.filter(|tx_num| *tx_num < tx_count))
    }

    pub fn tx_hash(&self, tx_num: TxNum) -> Result<Option<Hash256>, ChainStateError> {
        if tx_num >= self.state.tx_count {
            return Ok(None);
        }
        Ok(self.tx_nums.txid(tx_num)?)
    }

    /// Height of the block confirming `tx_num`, found by bisecting the
    /// cumulative tx counts of the header chain.
    pub fn tx_height(&self, tx_num: TxNum) -> Result<Option<u32>, ChainStateError> {
        if tx_num >= self.state.tx_count || self.state.height < 0 {
            return Ok(None);
        }
        let mut low = 0u32;
        let mut high = self.state.height as u32;
        while low < high {
            let mid = low + (high - low) / 2;
            let record = self.headers.get(mid)?.ok_or_else(|| {
                ChainStateError::Consistency(format!("header at height {mid} is missing"))
            })?;
            if record.tx_count > tx_num {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        Ok(Some(low))
    }

    pub fn lookup_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, ChainStateError> {
        let tx_count = self.state.tx_count;
        Ok(self
            .utxos
            .lookup(outpoint)?
            .filter(|record| record.tx_num < tx_count))
    }
}
