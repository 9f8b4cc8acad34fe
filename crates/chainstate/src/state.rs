//! The writer role: applies blocks through the write-back cache, commits under
//! the flush policy and rewinds committed blocks with their undo records.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use hashxd_log::{log_error, log_info, log_warn};
use hashxd_primitives::{hash256_to_hex, Block, Hash256, HashX, OutPoint, Transaction};
use hashxd_storage::KeyValueStore;
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::cache::WriteCache;
use crate::error::ChainStateError;
use crate::flush::{FlushController, FlushPolicy};
use crate::header::HeaderRecord;
use crate::store::ChainStore;
use crate::undo::{BlockUndo, CreatedTx, SpentUtxo};
use crate::utxo::UtxoRecord;
use crate::view::ChainView;
use crate::TxNum;

pub const DEFAULT_REORG_LIMIT: u32 = 200;

#[derive(Clone, Debug)]
pub struct ChainStateConfig {
    /// Deepest rewind the writer accepts; also the undo retention window.
    pub reorg_limit: u32,
    pub flush_policy: FlushPolicy,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            reorg_limit: DEFAULT_REORG_LIMIT,
            flush_policy: FlushPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Advance {
    Applied {
        height: u32,
        hash: Hash256,
        tx_count: u64,
    },
    /// The same block was already indexed at this height.
    AlreadyApplied { height: u32 },
}

/// What one commit made visible to readers.
#[derive(Clone, Debug)]
pub struct FlushOutcome {
    pub height: i32,
    pub tip: Hash256,
    pub tx_count: u64,
    /// Txids confirmed by the committed blocks, in tx-number order.
    pub confirmed: Vec<Hash256>,
    pub touched: HashSet<HashX>,
    pub blocks: Vec<(u32, Hash256)>,
}

#[derive(Clone, Debug)]
pub struct RewindOutcome {
    pub height: i32,
    pub tip: Hash256,
    pub tx_count: u64,
    /// Consumed undo records, highest block first.
    pub undone: Vec<BlockUndo>,
    pub touched: BTreeSet<HashX>,
    /// Cached blocks committed before the rewind started. Their commit still
    /// has to be announced like any other flush.
    pub flushed: Option<FlushOutcome>,
}

pub struct ChainState<S> {
    store: ChainStore<S>,
    cache: WriteCache,
    flush: FlushController,
    height: i32,
    tip: Hash256,
    tx_count: u64,
    reorg_limit: u32,
    min_undo_height: u32,
    first_sync: bool,
    poisoned: Option<String>,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn open(store: Arc<S>, config: ChainStateConfig) -> Result<Self, ChainStateError> {
        let store = ChainStore::open(store, config.reorg_limit)?;
        let state = store.state().clone();
        log_info!(
            "chain state at height {} tip {} ({} transactions, flush #{})",
            state.height,
            hash256_to_hex(&state.tip),
            state.tx_count,
            state.utxo_flush_count
        );
        Ok(Self {
            cache: WriteCache::new(),
            flush: FlushController::new(config.flush_policy),
            height: state.height,
            tip: state.tip,
            tx_count: state.tx_count,
            reorg_limit: config.reorg_limit,
            min_undo_height: 0,
            first_sync: state.first_sync,
            poisoned: None,
            store,
        })
    }

    /// Height of the writer's tip, including blocks not yet flushed.
    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn tip(&self) -> Hash256 {
        self.tip
    }

    pub fn tx_count(&self) -> u64 {
        self.tx_count
    }

    pub fn flushed_height(&self) -> i32 {
        self.store.state().height
    }

    pub fn reorg_limit(&self) -> u32 {
        self.reorg_limit
    }

    pub fn is_first_sync(&self) -> bool {
        self.first_sync
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn view(&self) -> ChainView<S> {
        self.store.view()
    }

    /// Undo data is only kept for blocks within `reorg_limit` of the upstream tip.
    pub fn set_upstream_height(&mut self, upstream_height: i32) {
        let min = i64::from(upstream_height) - i64::from(self.reorg_limit);
        self.min_undo_height = u32::try_from(min.max(0)).unwrap_or(u32::MAX);
    }

    /// Hash at `height` on the writer's chain, cached blocks included.
    pub fn header_hash(&self, height: u32) -> Result<Option<Hash256>, ChainStateError> {
        if i64::from(height) > i64::from(self.height) {
            return Ok(None);
        }
        let flushed = self.store.state().height;
        if i64::from(height) > i64::from(flushed) {
            let offset = (i64::from(height) - i64::from(flushed) - 1) as usize;
            return Ok(self.cache.header(offset).map(|record| record.hash));
        }
        Ok(self.store.header(height)?.map(|record| record.hash))
    }

    pub fn block_hashes(&self, start: u32, count: u32) -> Result<Vec<Hash256>, ChainStateError> {
        let mut hashes = Vec::with_capacity(count as usize);
        for height in start..start.saturating_add(count) {
            match self.header_hash(height)? {
                Some(hash) => hashes.push(hash),
                None => break,
            }
        }
        Ok(hashes)
    }

    fn ensure_writable(&self) -> Result<(), ChainStateError> {
        match &self.poisoned {
            Some(reason) => Err(ChainStateError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    fn reset_to_flushed(&mut self) {
        self.cache = WriteCache::new();
        let state = self.store.state();
        self.height = state.height;
        self.tip = state.tip;
        self.tx_count = state.tx_count;
    }

    /// Drops uncommitted work after a failure; fatal faults also halt the writer.
    fn abandon(&mut self, err: &ChainStateError) {
        self.reset_to_flushed();
        if err.is_fatal() {
            log_error!("chain state writer halted: {err}");
            self.poisoned = Some(err.to_string());
        } else {
            log_warn!(
                "discarded uncommitted blocks above height {} after error: {err}",
                self.height
            );
        }
    }

    /// Applies one block on top of the writer's tip. A block is applied in full
    /// or, on failure, all unflushed work is discarded.
    pub fn advance_block(&mut self, height: u32, block: &Block) -> Result<Advance, ChainStateError> {
        self.ensure_writable()?;
        let hash = block.hash();
        if i64::from(height) <= i64::from(self.height) {
            return match self.header_hash(height)? {
                Some(existing) if existing == hash => Ok(Advance::AlreadyApplied { height }),
                _ => Err(ChainStateError::Consistency(format!(
                    "block {} at height {height} conflicts with the indexed chain",
                    hash256_to_hex(&hash)
                ))),
            };
        }
        if i64::from(height) != i64::from(self.height) + 1 {
            return Err(ChainStateError::Consistency(format!(
                "block at height {height} does not follow tip height {}",
                self.height
            )));
        }
        if block.header.prev_block != self.tip {
            return Err(ChainStateError::Consistency(format!(
                "block {} does not extend tip {}",
                hash256_to_hex(&hash),
                hash256_to_hex(&self.tip)
            )));
        }

        let txids: Vec<Hash256> = block.transactions.par_iter().map(Transaction::txid).collect();
        match self.apply_transactions(height, hash, block, &txids) {
            Ok(tx_count) => Ok(Advance::Applied {
                height,
                hash,
                tx_count,
            }),
            Err(err) => {
                self.abandon(&err);
                Err(err)
            }
        }
    }

    fn apply_transactions(
        &mut self,
        height: u32,
        hash: Hash256,
        block: &Block,
        txids: &[Hash256],
    ) -> Result<u64, ChainStateError> {
        let prev_tx_count = self.tx_count;
        let write_undo = height >= self.min_undo_height;
        let mut spent = Vec::new();
        let mut created = Vec::with_capacity(if write_undo { txids.len() } else { 0 });

        for (offset, (tx, txid)) in block.transactions.iter().zip(txids).enumerate() {
            let tx_num: TxNum = prev_tx_count + offset as u64;
            let mut touched: SmallVec<[HashX; 4]> = SmallVec::new();

            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let record = self.spend_utxo(&input.prevout)?;
                    if !touched.contains(&record.hashx) {
                        touched.push(record.hashx);
                    }
                    if write_undo {
                        spent.push(SpentUtxo {
                            outpoint: input.prevout,
                            record,
                        });
                    }
                }
            }

            let mut outputs = Vec::new();
            for (index, output) in tx.outputs.iter().enumerate() {
                let Some(hashx) = HashX::from_script(&output.script_pubkey) else {
                    continue;
                };
                let index = index as u32;
                self.cache.add_utxo(
                    OutPoint::new(*txid, index),
                    UtxoRecord {
                        hashx,
                        tx_num,
                        index,
                        value: output.value,
                        height,
                    },
                );
                outputs.push((index, hashx));
                if !touched.contains(&hashx) {
                    touched.push(hashx);
                }
            }

            for hashx in touched {
                self.cache.add_history(hashx, tx_num);
            }
            self.cache.push_tx(*txid);
            if write_undo {
                created.push(CreatedTx {
                    txid: *txid,
                    outputs,
                });
            }
        }

        let tx_count = prev_tx_count + txids.len() as u64;
        self.cache.push_header(HeaderRecord {
            header: block.header.clone(),
            hash,
            tx_count,
        });
        if write_undo {
            self.cache.push_undo(BlockUndo {
                height,
                block_hash: hash,
                prev_hash: self.tip,
                prev_tx_count,
                spent,
                created,
            });
        }
        self.height = height as i32;
        self.tip = hash;
        self.tx_count = tx_count;
        Ok(tx_count)
    }

    fn spend_utxo(&mut self, outpoint: &OutPoint) -> Result<UtxoRecord, ChainStateError> {
        if let Some(record) = self.cache.take_utxo(outpoint) {
            return Ok(record);
        }
        if self.cache.spent_committed(outpoint) {
            return Err(ChainStateError::Consistency(format!(
                "output {outpoint} is spent twice"
            )));
        }
        match self.store.lookup_utxo(outpoint)? {
            Some(record) => {
                self.cache.record_committed_spend(*outpoint, record);
                Ok(record)
            }
            None => Err(ChainStateError::Consistency(format!(
                "input {outpoint} does not resolve to an unspent output"
            ))),
        }
    }

    pub fn pending_items(&self) -> usize {
        self.cache.pending_items()
    }

    pub fn pending_bytes(&self) -> usize {
        self.cache.estimated_bytes()
    }

    pub fn should_flush(&self) -> bool {
        self.flush.should_flush(
            self.cache.pending_items(),
            self.cache.estimated_bytes(),
            self.flush.elapsed(),
        )
    }

    /// Commits everything cached in one atomic batch and makes it durable.
    pub fn flush(&mut self) -> Result<Option<FlushOutcome>, ChainStateError> {
        self.ensure_writable()?;
        if self.cache.is_empty() {
            self.flush.mark_flushed();
            return Ok(None);
        }
        let started = Instant::now();
        let items = self.cache.pending_items();
        let first_height = (self.store.state().height + 1) as u32;
        let (batch, touched) = std::mem::take(&mut self.cache).into_batch();
        let confirmed = batch.tx_hashes.clone();
        let blocks: Vec<(u32, Hash256)> = batch
            .headers
            .iter()
            .enumerate()
            .map(|(offset, record)| (first_height + offset as u32, record.hash))
            .collect();

        let committed = self
            .store
            .apply_batch(batch, self.first_sync)
            .and_then(|_| self.store.flush());
        if let Err(err) = committed {
            self.abandon(&err);
            return Err(err);
        }
        self.flush.mark_flushed();

        let state = self.store.state();
        log_info!(
            "flushed {} block(s) to height {} ({} transactions, {} items) in {:.2?}",
            blocks.len(),
            state.height,
            state.tx_count,
            items,
            started.elapsed()
        );
        Ok(Some(FlushOutcome {
            height: state.height,
            tip: state.tip,
            tx_count: state.tx_count,
            confirmed,
            touched,
            blocks,
        }))
    }

    /// The final flush on shutdown, regardless of the flush thresholds.
    pub fn flush_for_shutdown(&mut self) -> Result<Option<FlushOutcome>, ChainStateError> {
        self.flush.request_shutdown();
        self.flush()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.flush.shutdown_requested()
    }

    /// Lowest height the writer may rewind to.
    pub fn min_rewind_height(&self) -> i32 {
        let min = i64::from(self.height) - i64::from(self.reorg_limit);
        min.max(-1) as i32
    }

    /// Rewinds to `target`, flushing pending blocks first.
    pub fn rewind_to(&mut self, target: i32) -> Result<RewindOutcome, ChainStateError> {
        self.ensure_writable()?;
        if target >= self.height {
            return Ok(RewindOutcome {
                height: self.height,
                tip: self.tip,
                tx_count: self.tx_count,
                undone: Vec::new(),
                touched: BTreeSet::new(),
                flushed: None,
            });
        }
        let min_height = self.min_rewind_height();
        if target < min_height {
            return Err(ChainStateError::ForkTooDeep {
                fork_height: target,
                min_height,
            });
        }
        let flushed = self.flush()?;

        let undone = match self.store.rewind_to(target) {
            Ok(undone) => undone,
            Err(err) => {
                self.abandon(&err);
                return Err(err);
            }
        };
        self.reset_to_flushed();
        self.flush.mark_flushed();
        let mut touched = BTreeSet::new();
        for undo in &undone {
            touched.extend(undo.touched());
        }
        Ok(RewindOutcome {
            height: self.height,
            tip: self.tip,
            tx_count: self.tx_count,
            undone,
            touched,
            flushed,
        })
    }

    /// Marks initial sync complete; persisted with the next flush.
    pub fn finish_first_sync(&mut self) {
        if self.first_sync {
            self.first_sync = false;
            log_info!("initial sync complete at height {}", self.height);
        }
    }
}
