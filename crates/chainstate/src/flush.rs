//! What has been durably committed, and when the writer should commit next.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hashxd_primitives::encoding::{DecodeError, Decoder, Encoder};
use hashxd_primitives::Hash256;

pub const FLUSH_STATE_KEY: &[u8] = b"flush_state";
const FLUSH_STATE_VERSION: u8 = 1;

/// The last committed position of the index. Written as the final entry of
/// every committed batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushState {
    /// Height of the committed tip, `-1` before genesis is indexed.
    pub height: i32,
    pub tip: Hash256,
    pub tx_count: u64,
    pub utxo_flush_count: u64,
    pub wall_time_secs: u64,
    pub first_sync: bool,
}

impl FlushState {
    pub fn empty() -> Self {
        Self {
            height: -1,
            tip: [0u8; 32],
            tx_count: 0,
            utxo_flush_count: 0,
            wall_time_secs: 0,
            first_sync: true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(70);
        encoder.write_u8(FLUSH_STATE_VERSION);
        encoder.write_i32_le(self.height);
        encoder.write_hash_le(&self.tip);
        encoder.write_u64_le(self.tx_count);
        encoder.write_u64_le(self.utxo_flush_count);
        encoder.write_u64_le(self.wall_time_secs);
        encoder.write_u8(u8::from(self.first_sync));
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != FLUSH_STATE_VERSION {
            return Err(DecodeError::InvalidData("unsupported flush state version"));
        }
        let height = decoder.read_i32_le()?;
        if height < -1 {
            return Err(DecodeError::InvalidData("flush state height out of range"));
        }
        let state = Self {
            height,
            tip: decoder.read_hash_le()?,
            tx_count: decoder.read_u64_le()?,
            utxo_flush_count: decoder.read_u64_le()?,
            wall_time_secs: decoder.read_u64_le()?,
            first_sync: decoder.read_u8()? != 0,
        };
        decoder.finish()?;
        Ok(state)
    }

    pub(crate) fn advanced(&self, height: i32, tip: Hash256, tx_count: u64, first_sync: bool) -> Self {
        Self {
            height,
            tip,
            tx_count,
            utxo_flush_count: self.utxo_flush_count + 1,
            wall_time_secs: unix_now_secs(),
            first_sync,
        }
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone, Debug)]
pub struct FlushPolicy {
    /// Ceiling on the estimated memory held by the write-back cache.
    pub cache_bytes: usize,
    pub max_pending_items: usize,
    /// Longest time pending work may stay uncommitted.
    pub max_staleness: Duration,
}

impl FlushPolicy {
    pub fn from_cache_mb(cache_mb: usize, max_staleness: Duration) -> Self {
        let cache_bytes = cache_mb.saturating_mul(1024 * 1024);
        Self {
            cache_bytes,
            max_pending_items: (cache_bytes / 32).max(1),
            max_staleness,
        }
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::from_cache_mb(1200, Duration::from_secs(300))
    }
}

pub struct FlushController {
    policy: FlushPolicy,
    last_flush: Instant,
    shutdown_requested: bool,
}

impl FlushController {
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            last_flush: Instant::now(),
            shutdown_requested: false,
        }
    }

    /// True once either ceiling is reached. Nothing pending never flushes.
    pub fn should_flush(
        &self,
        pending_items: usize,
        pending_bytes: usize,
        elapsed_since_last_flush: Duration,
    ) -> bool {
        if pending_items == 0 {
            return false;
        }
        pending_bytes >= self.policy.cache_bytes
            || pending_items >= self.policy.max_pending_items
            || elapsed_since_last_flush >= self.policy.max_staleness
    }

    pub fn elapsed(&self) -> Duration {
        self.last_flush.elapsed()
    }

    pub fn mark_flushed(&mut self) {
        self.last_flush = Instant::now();
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }
}
