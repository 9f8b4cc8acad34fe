use hashxd_primitives::block::{Block, BlockHeader, HEADER_SIZE};
use hashxd_primitives::encoding::DecodeError;
use hashxd_primitives::outpoint::OutPoint;
use hashxd_primitives::transaction::{Transaction, TxIn, TxOut};
use hashxd_primitives::{hash256_to_hex, sha256d};

fn seq_hash(start: u8) -> [u8; 32] {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

fn coinbase(tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, tag],
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        outputs: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

#[test]
fn header_layout_is_eighty_bytes() {
    let header = BlockHeader {
        version: 0x2000_0000,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x0102_0304,
        bits: 0x1d00_ffff,
        nonce: 0xdead_beef,
    };
    let encoded = header.consensus_encode();
    assert_eq!(encoded.len(), HEADER_SIZE);
    assert_eq!(&encoded[0..4], &0x2000_0000i32.to_le_bytes());
    assert_eq!(&encoded[4..36], &seq_hash(0x00));
    assert_eq!(&encoded[76..80], &0xdead_beefu32.to_le_bytes());
    assert_eq!(header.hash(), sha256d(&encoded));
    assert_eq!(
        BlockHeader::consensus_decode(&encoded).expect("decode header"),
        header
    );
}

#[test]
fn genesis_header_hash_matches_known_value() {
    let mut merkle_root =
        hashxd_primitives::hash256_from_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .expect("merkle hex");
    let header = BlockHeader {
        version: 1,
        prev_block: [0u8; 32],
        merkle_root,
        time: 1_231_006_505,
        bits: 0x1d00_ffff,
        nonce: 2_083_236_893,
    };
    assert_eq!(
        hash256_to_hex(&header.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );
    merkle_root[0] ^= 1;
    assert_ne!(
        hash256_to_hex(&BlockHeader { merkle_root, ..header }.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );
}

#[test]
fn segwit_txid_ignores_witness() {
    let mut tx = Transaction {
        version: 2,
        inputs: vec![TxIn {
            prevout: OutPoint::new(seq_hash(0x40), 3),
            script_sig: Vec::new(),
            sequence: 0xffff_fffd,
            witness: vec![vec![0x30; 71], vec![0x02; 33]],
        }],
        outputs: vec![TxOut {
            value: 12_345,
            script_pubkey: vec![0x00, 0x14, 0xaa],
        }],
        lock_time: 7,
    };
    let with_witness = tx.consensus_encode();
    assert_eq!(&with_witness[4..6], &[0x00, 0x01]);

    let decoded = Transaction::consensus_decode(&with_witness).expect("decode segwit");
    assert_eq!(decoded, tx);

    let txid = tx.txid();
    tx.inputs[0].witness.clear();
    let legacy = tx.consensus_encode();
    assert_eq!(legacy, tx.encode_without_witness());
    assert_eq!(sha256d(&legacy), txid);
    assert_eq!(
        Transaction::consensus_decode(&legacy).expect("decode legacy").txid(),
        txid
    );
}

#[test]
fn block_roundtrip_and_trailing_bytes() {
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: seq_hash(1),
            merkle_root: seq_hash(2),
            time: 10,
            bits: 0x207f_ffff,
            nonce: 3,
        },
        transactions: vec![coinbase(1)],
    };
    let mut raw = block.consensus_encode();
    assert_eq!(Block::consensus_decode(&raw).expect("decode block"), block);

    raw.push(0);
    assert_eq!(Block::consensus_decode(&raw), Err(DecodeError::TrailingBytes));
}

#[test]
fn block_must_start_with_coinbase() {
    let mut spend = coinbase(2);
    spend.inputs[0].prevout = OutPoint::new(seq_hash(9), 0);
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: 0,
        },
        transactions: vec![spend],
    };
    assert!(matches!(
        Block::consensus_decode(&block.consensus_encode()),
        Err(DecodeError::InvalidData(_))
    ));
}

#[test]
fn truncated_transaction_is_rejected() {
    let raw = coinbase(3).consensus_encode();
    assert!(Transaction::consensus_decode(&raw[..raw.len() - 1]).is_err());
}
