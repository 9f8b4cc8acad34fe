//! Block builders and an in-memory upstream node for unit tests.

use std::sync::{Arc, Mutex};

use hashxd_chainstate::{ChainState, ChainStateConfig, FlushPolicy};
use hashxd_primitives::{Block, BlockHeader, Hash256, HashX, OutPoint, Transaction, TxIn, TxOut};
use hashxd_storage::memory::MemoryStore;
use hashxd_storage::{Column, KeyValueStore, ScanResult};
use tokio::sync::watch;

use crate::daemon::{Daemon, DaemonError, Tip};

pub fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn hashx(tag: u8) -> HashX {
    HashX::from_script(&p2pkh_script(tag)).expect("indexed script")
}

fn pay(pays: &[(u8, i64)]) -> Vec<TxOut> {
    pays.iter()
        .map(|(tag, value)| TxOut {
            value: *value,
            script_pubkey: p2pkh_script(*tag),
        })
        .collect()
}

pub fn coinbase(height: u32, salt: u8, pays: &[(u8, i64)]) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(salt);
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        outputs: pay(pays),
        lock_time: 0,
    }
}

pub fn spend(inputs: &[OutPoint], pays: &[(u8, i64)]) -> Transaction {
    Transaction {
        version: 2,
        inputs: inputs
            .iter()
            .map(|prevout| TxIn {
                prevout: *prevout,
                script_sig: vec![0x51],
                sequence: u32::MAX,
                witness: Vec::new(),
            })
            .collect(),
        outputs: pay(pays),
        lock_time: 0,
    }
}

pub fn make_block(prev_block: Hash256, height: u32, salt: u8, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 4,
            prev_block,
            merkle_root: [salt; 32],
            time: 1_600_000_000 + height,
            bits: 0x207f_ffff,
            nonce: u32::from(salt),
        },
        transactions,
    }
}

/// `count` coinbase-only blocks paying 50 to `tag`, starting at `start` on top of `prev`.
pub fn coinbase_chain(prev: Hash256, start: u32, count: u32, tag: u8, salt: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count as usize);
    let mut prev = prev;
    for height in start..start + count {
        let block = make_block(prev, height, salt, vec![coinbase(height, salt, &[(tag, 50)])]);
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

pub fn open_chain(store: &Arc<MemoryStore>, reorg_limit: u32) -> ChainState<MemoryStore> {
    open_chain_with(store, reorg_limit, FlushPolicy::default())
}

pub fn open_chain_with<S: KeyValueStore>(
    store: &Arc<S>,
    reorg_limit: u32,
    flush_policy: FlushPolicy,
) -> ChainState<S> {
    let config = ChainStateConfig {
        reorg_limit,
        flush_policy,
    };
    ChainState::open(Arc::clone(store), config).expect("open chain state")
}

pub fn apply_all<S: KeyValueStore>(chain: &mut ChainState<S>, start: u32, blocks: &[Block]) {
    for (offset, block) in blocks.iter().enumerate() {
        chain
            .advance_block(start + offset as u32, block)
            .expect("advance block");
    }
}

pub fn index_dump(store: &MemoryStore) -> Vec<(Column, ScanResult)> {
    Column::ALL
        .iter()
        .copied()
        .filter(|column| *column != Column::Meta)
        .map(|column| (column, store.dump(column).expect("dump column")))
        .collect()
}

#[derive(Default)]
struct MockState {
    blocks: Vec<Block>,
    mempool: Vec<Transaction>,
    failures: usize,
    /// Blocks left to serve before `true` goes out on the signal.
    signal_after: Option<(usize, watch::Sender<bool>)>,
}

/// An upstream node serving a scripted chain and mempool.
#[derive(Default)]
pub struct MockDaemon {
    state: Mutex<MockState>,
}

impl MockDaemon {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            state: Mutex::new(MockState {
                blocks,
                ..MockState::default()
            }),
        }
    }

    pub fn push_blocks(&self, blocks: Vec<Block>) {
        self.state.lock().expect("mock").blocks.extend(blocks);
    }

    /// Drops every block from `height` up and appends `blocks` in their place.
    pub fn replace_from(&self, height: u32, blocks: Vec<Block>) {
        let mut state = self.state.lock().expect("mock");
        state.blocks.truncate(height as usize);
        state.blocks.extend(blocks);
    }

    pub fn set_mempool(&self, txs: Vec<Transaction>) {
        self.state.lock().expect("mock").mempool = txs;
    }

    /// The next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().expect("mock").failures = count;
    }

    /// Sends `true` on `signal` once `served` more blocks have been handed out.
    pub fn signal_after_blocks(&self, served: usize, signal: watch::Sender<bool>) {
        self.state.lock().expect("mock").signal_after = Some((served, signal));
    }

    fn block_served(&self) {
        let mut state = self.state.lock().expect("mock");
        if let Some((remaining, signal)) = state.signal_after.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                signal.send_replace(true);
            }
        }
    }

    fn with_state<T>(&self, read: impl FnOnce(&MockState) -> T) -> Result<T, DaemonError> {
        let mut state = self.state.lock().expect("mock");
        if state.failures > 0 {
            state.failures -= 1;
            return Err(DaemonError::Transient("connection refused".to_string()));
        }
        Ok(read(&state))
    }
}

impl Daemon for MockDaemon {
    async fn current_tip(&self) -> Result<Tip, DaemonError> {
        self.with_state(|state| match state.blocks.last() {
            Some(block) => Tip {
                height: state.blocks.len() as i32 - 1,
                hash: block.hash(),
            },
            None => Tip {
                height: -1,
                hash: [0u8; 32],
            },
        })
    }

    async fn block_hash(&self, height: u32) -> Result<Option<Hash256>, DaemonError> {
        self.with_state(|state| state.blocks.get(height as usize).map(Block::hash))
    }

    async fn get_header(&self, height: u32) -> Result<Option<BlockHeader>, DaemonError> {
        self.with_state(|state| {
            state
                .blocks
                .get(height as usize)
                .map(|block| block.header.clone())
        })
    }

    async fn get_block(&self, hash: &Hash256) -> Result<Vec<u8>, DaemonError> {
        let raw = self
            .with_state(|state| {
                state
                    .blocks
                    .iter()
                    .find(|block| block.hash() == *hash)
                    .map(Block::consensus_encode)
            })?
            .ok_or_else(|| DaemonError::Rejected("block not found".to_string()))?;
        self.block_served();
        Ok(raw)
    }

    async fn mempool_txids(&self) -> Result<Vec<Hash256>, DaemonError> {
        self.with_state(|state| state.mempool.iter().map(Transaction::txid).collect())
    }

    async fn raw_transaction(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, DaemonError> {
        self.with_state(|state| {
            state
                .mempool
                .iter()
                .find(|tx| tx.txid() == *txid)
                .map(Transaction::consensus_encode)
                .or_else(|| {
                    state
                        .blocks
                        .iter()
                        .flat_map(|block| block.transactions.iter())
                        .find(|tx| tx.txid() == *txid)
                        .map(Transaction::consensus_encode)
                })
        })
    }
}
