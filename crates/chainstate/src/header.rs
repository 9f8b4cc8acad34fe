//! Header chain keyed by height, each row carrying the cumulative tx count.

use hashxd_primitives::block::{BlockHeader, HEADER_SIZE};
use hashxd_primitives::encoding::{DecodeError, Decoder};
use hashxd_primitives::Hash256;
use hashxd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const HEADER_RECORD_LEN: usize = HEADER_SIZE + 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderRecord {
    pub header: BlockHeader,
    pub hash: Hash256,
    /// Transactions confirmed up to and including this block.
    pub tx_count: u64,
}

impl HeaderRecord {
    pub fn new(header: BlockHeader, tx_count: u64) -> Self {
        let hash = header.hash();
        Self {
            header,
            hash,
            tx_count,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_RECORD_LEN] {
        let mut out = [0u8; HEADER_RECORD_LEN];
        out[..HEADER_SIZE].copy_from_slice(&self.header.consensus_encode());
        out[HEADER_SIZE..].copy_from_slice(&self.tx_count.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let tx_count = decoder.read_u64_le()?;
        decoder.finish()?;
        Ok(Self::new(header, tx_count))
    }
}

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

#[derive(Clone)]
pub struct HeaderChain<S> {
    store: S,
}

impl<S> HeaderChain<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> HeaderChain<S> {
    pub fn put(&self, batch: &mut WriteBatch, height: u32, record: &HeaderRecord) {
        batch.put(Column::Header, height_key(height), record.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, height: u32) {
        batch.delete(Column::Header, height_key(height));
    }

    pub fn get(&self, height: u32) -> Result<Option<HeaderRecord>, StoreError> {
        let Some(bytes) = self.store.get(Column::Header, &height_key(height))? else {
            return Ok(None);
        };
        HeaderRecord::decode(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Backend(format!("invalid header at {height}: {err}")))
    }

    /// Heights with a stored header at or above `from`.
    pub fn heights_from(&self, from: u32) -> Result<Vec<u32>, StoreError> {
        let mut out = Vec::new();
        self.store.for_each_range(
            Column::Header,
            &height_key(from),
            &height_key(u32::MAX),
            &mut |key, _| {
                let raw: [u8; 4] = key
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid header key".to_string()))?;
                out.push(u32::from_be_bytes(raw));
                Ok(())
            },
        )?;
        Ok(out)
    }
}
