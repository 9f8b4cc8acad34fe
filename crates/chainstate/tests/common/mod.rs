#![allow(dead_code)]

use std::sync::Arc;

use hashxd_chainstate::{ChainState, ChainStateConfig, FlushPolicy};
use hashxd_primitives::{Block, BlockHeader, Hash256, HashX, OutPoint, Transaction, TxIn, TxOut};
use hashxd_storage::memory::MemoryStore;
use hashxd_storage::{Column, ScanResult};

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
        outputs: pays
            .iter()
            .map(|(tag, value)| TxOut {
                value: *value,
                script_pubkey: p2pkh_script(*tag),
            })
            .collect(),
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
        outputs: pays
            .iter()
            .map(|(tag, value)| TxOut {
                value: *value,
                script_pubkey: p2pkh_script(*tag),
            })
            .collect(),
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

/// Appends `count` coinbase-only blocks paying `tag` on top of `prev`.
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

pub fn config(reorg_limit: u32) -> ChainStateConfig {
    ChainStateConfig {
        reorg_limit,
        flush_policy: FlushPolicy::default(),
    }
}

pub fn open(store: &Arc<MemoryStore>, reorg_limit: u32) -> ChainState<MemoryStore> {
    ChainState::open(Arc::clone(store), config(reorg_limit)).expect("open chain state")
}

pub fn apply_all(chain: &mut ChainState<MemoryStore>, start: u32, blocks: &[Block]) {
    for (offset, block) in blocks.iter().enumerate() {
        chain
            .advance_block(start + offset as u32, block)
            .expect("advance block");
    }
}

/// Every index column except the flush state, which counts flushes.
pub fn index_dump(store: &MemoryStore) -> Vec<(Column, ScanResult)> {
    Column::ALL
        .iter()
        .copied()
        .filter(|column| *column != Column::Meta)
        .map(|column| (column, store.dump(column).expect("dump column")))
        .collect()
}
