//! Read-side API: committed index plus the current mempool snapshot.

use std::fmt;
use std::sync::Arc;

use hashxd_chainstate::{ChainSnapshot, ChainStateError, ChainView, TxNum};
use hashxd_primitives::{Hash256, HashX, OutPoint};
use hashxd_storage::KeyValueStore;
use tokio::sync::{broadcast, watch};

use crate::daemon::{Daemon, DaemonError};
use crate::mempool::{MempoolSnapshot, MempoolTx};
use crate::notify::{Notification, Notifier};

#[derive(Debug)]
pub enum QueryError {
    Chain(ChainStateError),
    Daemon(DaemonError),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Chain(err) => write!(f, "{err}"),
            QueryError::Daemon(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<ChainStateError> for QueryError {
    fn from(err: ChainStateError) -> Self {
        QueryError::Chain(err)
    }
}

impl From<DaemonError> for QueryError {
    fn from(err: DaemonError) -> Self {
        QueryError::Daemon(err)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Balance {
    pub confirmed: i64,
    /// Net mempool effect, may be negative.
    pub unconfirmed: i64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HistoryEntry {
    Confirmed {
        tx_num: TxNum,
        txid: Hash256,
        height: u32,
    },
    Unconfirmed {
        txid: Hash256,
        fee: i64,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub outpoint: OutPoint,
    pub value: i64,
    /// `None` for mempool outputs.
    pub height: Option<u32>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxLookup {
    pub raw: Vec<u8>,
    /// Confirming height, or `None` while unconfirmed.
    pub height: Option<u32>,
}

pub struct QueryService<D, S> {
    view: ChainView<S>,
    snapshots: watch::Receiver<Arc<MempoolSnapshot>>,
    daemon: Arc<D>,
    notifier: Notifier,
}

impl<D, S> Clone for QueryService<D, S> {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            snapshots: self.snapshots.clone(),
            daemon: Arc::clone(&self.daemon),
            notifier: self.notifier.clone(),
        }
    }
}

impl<D: Daemon, S: KeyValueStore> QueryService<D, S> {
    pub fn new(
        view: ChainView<S>,
        snapshots: watch::Receiver<Arc<MempoolSnapshot>>,
        daemon: Arc<D>,
        notifier: Notifier,
    ) -> Self {
        Self {
            view,
            snapshots,
            daemon,
            notifier,
        }
    }

    pub fn view(&self) -> &ChainView<S> {
        &self.view
    }

    pub fn mempool(&self) -> Arc<MempoolSnapshot> {
        Arc::clone(&*self.snapshots.borrow())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Mempool transactions touching `hashx`, minus any the committed index
    /// already holds because the snapshot predates the latest flush.
    fn unconfirmed(
        chain: &ChainSnapshot,
        snapshot: &MempoolSnapshot,
        hashx: &HashX,
    ) -> Result<Vec<Arc<MempoolTx>>, ChainStateError> {
        let txs = snapshot.transactions(hashx);
        if chain.height() <= snapshot.height() {
            return Ok(txs);
        }
        let mut live = Vec::with_capacity(txs.len());
        for tx in txs {
            if chain.tx_num(&tx.txid)?.is_none() {
                live.push(tx);
            }
        }
        Ok(live)
    }

    pub fn get_balance(&self, hashx: &HashX) -> Result<Balance, QueryError> {
        let snapshot = self.mempool();
        let chain = self.view.snapshot()?;
        let confirmed = chain.balance(hashx)?;
        let unconfirmed = Self::unconfirmed(&chain, &snapshot, hashx)?
            .iter()
            .map(|tx| tx.delta_for(hashx))
            .sum();
        Ok(Balance {
            confirmed,
            unconfirmed,
        })
    }

    /// Confirmed entries in chain order, then mempool entries oldest first.
    pub fn get_history(&self, hashx: &HashX) -> Result<Vec<HistoryEntry>, QueryError> {
        let snapshot = self.mempool();
        let chain = self.view.snapshot()?;
        let mut out = Vec::new();
        for tx_num in chain.history(hashx)? {
            let txid = chain.tx_hash(tx_num)?.ok_or_else(|| {
                ChainStateError::Consistency(format!("tx number {tx_num} has no hash"))
            })?;
            let height = chain.tx_height(tx_num)?.ok_or_else(|| {
                ChainStateError::Consistency(format!("tx number {tx_num} has no height"))
            })?;
            out.push(HistoryEntry::Confirmed {
                tx_num,
                txid,
                height,
            });
        }
        for tx in Self::unconfirmed(&chain, &snapshot, hashx)? {
            out.push(HistoryEntry::Unconfirmed {
                txid: tx.txid,
                fee: tx.fee,
            });
        }
        Ok(out)
    }

    /// Confirmed outputs no mempool transaction spends, then unspent mempool outputs.
    pub fn get_utxos(&self, hashx: &HashX) -> Result<Vec<UtxoEntry>, QueryError> {
        let snapshot = self.mempool();
        let chain = self.view.snapshot()?;
        let mut out = Vec::new();
        for record in chain.utxos(hashx)? {
            let txid = chain.tx_hash(record.tx_num)?.ok_or_else(|| {
                ChainStateError::Consistency(format!("tx number {} has no hash", record.tx_num))
            })?;
            let outpoint = OutPoint::new(txid, record.index);
            if snapshot.spender(&outpoint).is_some() {
                continue;
            }
            out.push(UtxoEntry {
                outpoint,
                value: record.value,
                height: Some(record.height),
            });
        }
        let live = Self::unconfirmed(&chain, &snapshot, hashx)?;
        for utxo in snapshot.unspent_outputs(hashx) {
            if live.iter().any(|tx| tx.txid == utxo.outpoint.txid) {
                out.push(UtxoEntry {
                    outpoint: utxo.outpoint,
                    value: utxo.value,
                    height: None,
                });
            }
        }
        Ok(out)
    }

    /// Raw bytes from the mempool snapshot or the upstream node, with the
    /// confirming height from the committed index.
    pub async fn lookup_transaction(&self, txid: &Hash256) -> Result<Option<TxLookup>, QueryError> {
        let chain = self.view.snapshot()?;
        let height = match chain.tx_num(txid)? {
            Some(tx_num) => chain.tx_height(tx_num)?,
            None => None,
        };
        let pooled = self.mempool().get(txid).map(|tx| tx.raw.clone());
        let raw = match pooled {
            Some(raw) => Some(raw),
            None => self.daemon.raw_transaction(txid).await?,
        };
        Ok(raw.map(|raw| TxLookup { raw, height }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::mempool::{sync_once, ConflictPolicy, MempoolTracker};
    use crate::test_support::*;
    use hashxd_chainstate::{ChainState, FlushPolicy};
    use hashxd_primitives::Block;
    use hashxd_storage::memory::MemoryStore;
    use hashxd_storage::{Column, PrefixVisitor, ScanResult, Snapshot, StoreError, WriteBatch};

    struct Fixture {
        daemon: Arc<MockDaemon>,
        chain: ChainState<MemoryStore>,
        tracker: Arc<Mutex<MempoolTracker<MemoryStore>>>,
        query: QueryService<MockDaemon, MemoryStore>,
        blocks: Vec<Block>,
    }

    fn fixture(blocks: Vec<Block>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut chain = open_chain(&store, 10);
        apply_all(&mut chain, 0, &blocks);
        chain.flush().expect("flush");
        let daemon = Arc::new(MockDaemon::new(blocks.clone()));
        let notifier = Notifier::new();
        let tracker = MempoolTracker::new(chain.view(), ConflictPolicy::KeepFirst, notifier.clone())
            .expect("tracker");
        let query = QueryService::new(
            chain.view(),
            tracker.subscribe(),
            Arc::clone(&daemon),
            notifier,
        );
        Fixture {
            daemon,
            chain,
            tracker: Arc::new(Mutex::new(tracker)),
            query,
            blocks,
        }
    }

    async fn refresh(fx: &Fixture) {
        let writer = Mutex::new(());
        sync_once(fx.daemon.as_ref(), &fx.tracker, &writer)
            .await
            .expect("mempool sync");
    }

    #[test]
    fn spent_output_leaves_a_two_entry_history_and_zero_balance() {
        let mut blocks = coinbase_chain([0u8; 32], 0, 10, 1, 0);
        let funding = make_block(
            blocks[9].hash(),
            10,
            1,
            vec![coinbase(10, 1, &[(5, 5000)])],
        );
        let receive_txid = funding.transactions[0].txid();
        blocks.push(funding);
        let more = coinbase_chain(blocks[10].hash(), 11, 3, 1, 0);
        blocks.extend(more);
        let spender = spend(&[OutPoint::new(receive_txid, 0)], &[(6, 4900)]);
        let spend_block = make_block(
            blocks[13].hash(),
            14,
            2,
            vec![coinbase(14, 2, &[(1, 50)]), spender.clone()],
        );
        blocks.push(spend_block);
        let fx = fixture(blocks);

        let x = hashx(5);
        let balance = fx.query.get_balance(&x).expect("balance");
        assert_eq!(balance, Balance::default());
        let history = fx.query.get_history(&x).expect("history");
        assert_eq!(
            history,
            vec![
                HistoryEntry::Confirmed {
                    tx_num: 10,
                    txid: receive_txid,
                    height: 10,
                },
                HistoryEntry::Confirmed {
                    tx_num: 15,
                    txid: spender.txid(),
                    height: 14,
                },
            ]
        );
        assert!(fx.query.get_utxos(&x).expect("utxos").is_empty());
    }

    #[tokio::test]
    async fn mempool_activity_is_merged_into_every_answer() {
        let fx = fixture(coinbase_chain([0u8; 32], 0, 3, 1, 0));
        let funding = OutPoint::new(fx.blocks[0].transactions[0].txid(), 0);
        let pending = spend(&[funding], &[(2, 30), (1, 15)]);
        fx.daemon.set_mempool(vec![pending.clone()]);
        refresh(&fx).await;

        let payer = fx.query.get_balance(&hashx(1)).expect("balance");
        assert_eq!(payer, Balance { confirmed: 150, unconfirmed: -35 });
        let payee = fx.query.get_balance(&hashx(2)).expect("balance");
        assert_eq!(payee, Balance { confirmed: 0, unconfirmed: 30 });

        let utxos = fx.query.get_utxos(&hashx(1)).expect("utxos");
        assert_eq!(utxos.len(), 3);
        assert!(!utxos.iter().any(|utxo| utxo.outpoint == funding));
        assert!(utxos
            .iter()
            .any(|utxo| utxo.outpoint == OutPoint::new(pending.txid(), 1) && utxo.height.is_none()));

        let history = fx.query.get_history(&hashx(2)).expect("history");
        assert_eq!(
            history,
            vec![HistoryEntry::Unconfirmed {
                txid: pending.txid(),
                fee: 5,
            }]
        );

        let lookup = fx
            .query
            .lookup_transaction(&pending.txid())
            .await
            .expect("lookup")
            .expect("found");
        assert_eq!(lookup.height, None);
        assert_eq!(lookup.raw, pending.consensus_encode());
    }

    #[tokio::test]
    async fn confirmed_lookup_reports_its_height() {
        let fx = fixture(coinbase_chain([0u8; 32], 0, 3, 1, 0));
        let txid = fx.blocks[2].transactions[0].txid();
        let lookup = fx
            .query
            .lookup_transaction(&txid)
            .await
            .expect("lookup")
            .expect("found");
        assert_eq!(lookup.height, Some(2));
        assert!(fx
            .query
            .lookup_transaction(&[0xee; 32])
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn stale_snapshot_never_counts_a_confirmed_transaction_twice() {
        let mut fx = fixture(coinbase_chain([0u8; 32], 0, 3, 1, 0));
        let funding = OutPoint::new(fx.blocks[0].transactions[0].txid(), 0);
        let pending = spend(&[funding], &[(2, 45)]);
        fx.daemon.set_mempool(vec![pending.clone()]);
        refresh(&fx).await;

        let tip = fx.chain.tip();
        let block = make_block(tip, 3, 4, vec![coinbase(3, 4, &[(9, 50)]), pending.clone()]);
        fx.chain.advance_block(3, &block).expect("advance");
        fx.chain.flush().expect("flush");

        let balance = fx.query.get_balance(&hashx(2)).expect("balance");
        assert_eq!(balance, Balance { confirmed: 45, unconfirmed: 0 });
        let history = fx.query.get_history(&hashx(2)).expect("history");
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0], HistoryEntry::Confirmed { height: 3, .. }));
        let utxos = fx.query.get_utxos(&hashx(2)).expect("utxos");
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].height, Some(3));
    }

    /// Holds the next committed batch back and lands it just after a reader
    /// starts: right after a store snapshot is taken, or right after a live
    /// read of the flush state.
    #[derive(Default)]
    struct DeferStore {
        inner: MemoryStore,
        hold_next: AtomicBool,
        held: Mutex<Option<WriteBatch>>,
    }

    impl DeferStore {
        fn hold_next_batch(&self) {
            self.hold_next.store(true, Ordering::SeqCst);
        }

        fn release(&self) -> Result<(), StoreError> {
            let held = self.held.lock().expect("held batch").take();
            match held {
                Some(batch) => self.inner.write_batch(&batch),
                None => Ok(()),
            }
        }
    }

    impl KeyValueStore for DeferStore {
        fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            let value = self.inner.get(column, key)?;
            if column == Column::Meta {
                self.release()?;
            }
            Ok(value)
        }

        fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.inner.put(column, key, value)
        }

        fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
            self.inner.delete(column, key)
        }

        fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
            self.inner.scan_prefix(column, prefix)
        }

        fn for_each_prefix<'a>(
            &self,
            column: Column,
            prefix: &[u8],
            visitor: &mut PrefixVisitor<'a>,
        ) -> Result<(), StoreError> {
            self.inner.for_each_prefix(column, prefix, visitor)
        }

        fn for_each_range<'a>(
            &self,
            column: Column,
            start: &[u8],
            end: &[u8],
            visitor: &mut PrefixVisitor<'a>,
        ) -> Result<(), StoreError> {
            self.inner.for_each_range(column, start, end, visitor)
        }

        fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
            if self.hold_next.swap(false, Ordering::SeqCst) {
                *self.held.lock().expect("held batch") = Some(batch.clone());
                return Ok(());
            }
            self.inner.write_batch(batch)
        }

        fn persist(&self) -> Result<(), StoreError> {
            self.inner.persist()
        }

        fn snapshot(&self) -> Result<Snapshot, StoreError> {
            let snapshot = self.inner.snapshot()?;
            self.release()?;
            Ok(snapshot)
        }
    }

    #[test]
    fn a_commit_landing_mid_query_is_invisible_to_that_query() {
        let blocks = coinbase_chain([0u8; 32], 0, 2, 1, 0);
        let store = Arc::new(DeferStore::default());
        let mut chain = open_chain_with(&store, 10, FlushPolicy::default());
        apply_all(&mut chain, 0, &blocks);
        chain.flush().expect("flush");
        let notifier = Notifier::new();
        let tracker = MempoolTracker::new(chain.view(), ConflictPolicy::KeepFirst, notifier.clone())
            .expect("tracker");
        let query = QueryService::new(
            chain.view(),
            tracker.subscribe(),
            Arc::new(MockDaemon::new(blocks.clone())),
            notifier,
        );

        let spender = spend(
            &[OutPoint::new(blocks[0].transactions[0].txid(), 0)],
            &[(1, 50)],
        );
        let block = make_block(
            blocks[1].hash(),
            2,
            3,
            vec![coinbase(2, 3, &[(1, 50)]), spender],
        );
        store.hold_next_batch();
        chain.advance_block(2, &block).expect("advance");
        chain.flush().expect("flush");

        let x = hashx(1);
        let during = query.get_balance(&x).expect("balance");
        assert_eq!(during.confirmed, 100);

        let after = query.get_balance(&x).expect("balance");
        assert_eq!(after.confirmed, 150);
        let history = query.get_history(&x).expect("history");
        let heights: Vec<_> = history
            .iter()
            .map(|entry| match entry {
                HistoryEntry::Confirmed { tx_num, height, .. } => (*tx_num, *height),
                HistoryEntry::Unconfirmed { .. } => panic!("nothing is pending"),
            })
            .collect();
        assert_eq!(heights, vec![(0, 0), (1, 1), (2, 2), (3, 2)]);
    }

    #[test]
    fn one_chain_snapshot_answers_every_read_of_a_query() {
        let blocks = coinbase_chain([0u8; 32], 0, 3, 1, 0);
        let mut fx = fixture(blocks.clone());
        let pinned = fx.query.view().snapshot().expect("snapshot");

        let rewound = fx.chain.rewind_to(0).expect("rewind");
        assert_eq!(rewound.height, 0);
        assert_eq!(fx.query.get_balance(&hashx(1)).expect("balance").confirmed, 50);

        assert_eq!(pinned.height(), 2);
        let history = pinned.history(&hashx(1)).expect("history");
        assert_eq!(history, vec![0, 1, 2]);
        for tx_num in history {
            assert_eq!(
                pinned.tx_hash(tx_num).expect("hash"),
                Some(blocks[tx_num as usize].transactions[0].txid())
            );
            assert_eq!(pinned.tx_height(tx_num).expect("height"), Some(tx_num as u32));
        }
        assert_eq!(pinned.balance(&hashx(1)).expect("balance"), 150);
    }
}
