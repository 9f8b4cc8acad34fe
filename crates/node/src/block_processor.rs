//! Follows the upstream chain: fetches missing blocks, applies them through
//! the writer's cache and hands divergence to the reorg handler.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hashxd_chainstate::{ChainState, ChainStateError, FlushOutcome};
use hashxd_primitives::{hash256_to_hex, Block, Hash256};
use hashxd_storage::KeyValueStore;
use tokio::sync::watch;

use crate::daemon::{retry_with_backoff, Backoff, Daemon, DaemonError};
use crate::mempool::SharedMempool;
use crate::notify::{Notification, Notifier};
use crate::reorg;

pub const DEFAULT_FETCH_BUDGET_BYTES: usize = 10 * 1024 * 1024;
const INITIAL_FETCH_COUNT: u32 = 10;
const MAX_FETCH_COUNT: u32 = 500;

#[derive(Debug)]
pub enum ProcessorError {
    Chain(ChainStateError),
    Daemon(DaemonError),
    LockPoisoned,
    Shutdown,
}

impl ProcessorError {
    /// Fatal errors stop the processor; the rest pause it and retry.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProcessorError::Chain(err) => err.is_fatal(),
            ProcessorError::Daemon(err) => !err.is_transient(),
            ProcessorError::LockPoisoned => true,
            ProcessorError::Shutdown => false,
        }
    }
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorError::Chain(err) => write!(f, "{err}"),
            ProcessorError::Daemon(err) => write!(f, "{err}"),
            ProcessorError::LockPoisoned => write!(f, "write lock poisoned"),
            ProcessorError::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<ChainStateError> for ProcessorError {
    fn from(err: ChainStateError) -> Self {
        ProcessorError::Chain(err)
    }
}

impl From<DaemonError> for ProcessorError {
    fn from(err: DaemonError) -> Self {
        ProcessorError::Daemon(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncState {
    /// Behind the upstream tip with no fork suspected.
    CatchingUp,
    /// Local tip equals the upstream tip.
    Synced,
    /// The local tip is not on the upstream chain.
    ReorgCheck,
}

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub poll_interval: Duration,
    pub backoff: Backoff,
    pub fetch_budget_bytes: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            backoff: Backoff::default(),
            fetch_budget_bytes: DEFAULT_FETCH_BUDGET_BYTES,
        }
    }
}

/// Sizes block fetches to fit the prefetch budget given recent block sizes.
#[derive(Clone, Debug)]
pub struct FetchSizer {
    budget_bytes: usize,
    avg_block_size: usize,
}

impl FetchSizer {
    pub fn new(budget_bytes: usize) -> Self {
        let budget_bytes = budget_bytes.max(1);
        Self {
            budget_bytes,
            avg_block_size: (budget_bytes / INITIAL_FETCH_COUNT as usize).max(1),
        }
    }

    pub fn next_count(&self) -> u32 {
        let count = self.budget_bytes / self.avg_block_size.max(1);
        (count.min(MAX_FETCH_COUNT as usize) as u32).max(1)
    }

    /// Small samples only nudge the running average.
    pub fn observe(&mut self, total_bytes: usize, blocks: usize) {
        if blocks == 0 {
            return;
        }
        self.avg_block_size = if blocks >= 10 {
            total_bytes / blocks
        } else {
            (total_bytes + (10 - blocks) * self.avg_block_size) / 10
        }
        .max(1);
    }

    pub fn avg_block_size(&self) -> usize {
        self.avg_block_size
    }
}

/// Retries a daemon call until it succeeds, is rejected or shutdown begins.
pub(crate) async fn fetch<T, F, Fut>(
    what: &str,
    backoff: Backoff,
    shutdown: &mut watch::Receiver<bool>,
    op: F,
) -> Result<T, ProcessorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DaemonError>>,
{
    match retry_with_backoff(what, backoff, shutdown, op).await {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(ProcessorError::Daemon(err)),
        None => Err(ProcessorError::Shutdown),
    }
}

pub struct BlockProcessor<D, S> {
    daemon: Arc<D>,
    chain: ChainState<S>,
    mempool: SharedMempool<S>,
    notifier: Notifier,
    writer: Arc<Mutex<()>>,
    shutdown: watch::Receiver<bool>,
    caught_up: watch::Sender<bool>,
    sizer: FetchSizer,
    state: SyncState,
    config: ProcessorConfig,
}

impl<D: Daemon, S: KeyValueStore> BlockProcessor<D, S> {
    pub fn new(
        daemon: Arc<D>,
        chain: ChainState<S>,
        mempool: SharedMempool<S>,
        notifier: Notifier,
        writer: Arc<Mutex<()>>,
        shutdown: watch::Receiver<bool>,
        config: ProcessorConfig,
    ) -> Self {
        let (caught_up, _) = watch::channel(false);
        Self {
            daemon,
            chain,
            mempool,
            notifier,
            writer,
            shutdown,
            caught_up,
            sizer: FetchSizer::new(config.fetch_budget_bytes),
            state: SyncState::CatchingUp,
            config,
        }
    }

    pub fn chain(&self) -> &ChainState<S> {
        &self.chain
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Flips to `true` whenever the local tip matches upstream.
    pub fn subscribe_caught_up(&self) -> watch::Receiver<bool> {
        self.caught_up.subscribe()
    }

    fn set_caught_up(&self, value: bool) {
        let changed = self.caught_up.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
        if changed && value {
            log_info!(
                "caught up with upstream at height {} tip {}",
                self.chain.height(),
                hash256_to_hex(&self.chain.tip())
            );
        }
    }

    /// Runs until shutdown or a fatal fault, then commits pending work.
    pub async fn run(mut self) -> Result<(), ProcessorError> {
        let result = self.run_loop().await;
        if let Err(err) = &result {
            log_error!("block processor stopped: {err}");
        }
        let flushed = self.final_flush();
        result.and(flushed)
    }

    async fn run_loop(&mut self) -> Result<(), ProcessorError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let wait = match self.step().await {
                Ok(SyncState::Synced) => self.config.poll_interval,
                Ok(_) => continue,
                Err(ProcessorError::Shutdown) => return Ok(()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log_warn!("block processing paused: {err}");
                    self.config.backoff.initial
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn final_flush(&mut self) -> Result<(), ProcessorError> {
        if self.chain.is_poisoned() {
            log_warn!("skipping final flush: writer halted after a fatal fault");
            return Ok(());
        }
        let _guard = self
            .writer
            .lock()
            .map_err(|_| ProcessorError::LockPoisoned)?;
        if let Some(outcome) = self.chain.flush_for_shutdown()? {
            log_info!(
                "final flush committed height {} ({} transactions)",
                outcome.height,
                outcome.tx_count
            );
        }
        Ok(())
    }

    /// One iteration of the sync state machine.
    pub async fn step(&mut self) -> Result<SyncState, ProcessorError> {
        let daemon = Arc::clone(&self.daemon);
        let backoff = self.config.backoff;
        let upstream = fetch("fetch upstream tip", backoff, &mut self.shutdown, || {
            daemon.current_tip()
        })
        .await?;
        self.chain.set_upstream_height(upstream.height);

        self.state = self.classify(upstream.height, upstream.hash).await?;
        match self.state {
            SyncState::Synced => {
                self.set_caught_up(true);
                self.flush_and_publish()?;
                self.chain.finish_first_sync();
            }
            SyncState::ReorgCheck => {
                self.set_caught_up(false);
                self.handle_reorg().await?;
                self.state = SyncState::CatchingUp;
            }
            SyncState::CatchingUp => {
                self.set_caught_up(false);
                self.catch_up(upstream.height).await?;
            }
        }
        Ok(self.state)
    }

    async fn classify(&mut self, upstream_height: i32, upstream_tip: Hash256) -> Result<SyncState, ProcessorError> {
        let local_height = self.chain.height();
        if local_height == upstream_height && self.chain.tip() == upstream_tip {
            return Ok(SyncState::Synced);
        }
        if local_height > upstream_height {
            return Ok(SyncState::ReorgCheck);
        }
        if local_height < 0 {
            return Ok(SyncState::CatchingUp);
        }
        let daemon = Arc::clone(&self.daemon);
        let height = local_height as u32;
        let hash_there = fetch("fetch upstream block hash", self.config.backoff, &mut self.shutdown, || {
            daemon.block_hash(height)
        })
        .await?;
        if hash_there == Some(self.chain.tip()) {
            Ok(SyncState::CatchingUp)
        } else {
            Ok(SyncState::ReorgCheck)
        }
    }

    async fn catch_up(&mut self, upstream_height: i32) -> Result<(), ProcessorError> {
        let start = (self.chain.height() + 1) as u32;
        let remaining = (upstream_height - self.chain.height()).max(0) as u32;
        let count = self.sizer.next_count().min(remaining);
        if count == 0 {
            return Ok(());
        }
        let daemon = Arc::clone(&self.daemon);
        let backoff = self.config.backoff;
        let hashes = fetch("fetch block hashes", backoff, &mut self.shutdown, || {
            daemon.block_hashes(start, count)
        })
        .await?;
        let Some(blocks) = self.fetch_blocks(start, &hashes).await? else {
            return Ok(());
        };
        if blocks.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let mut applied = 0u32;
        {
            let _guard = self
                .writer
                .lock()
                .map_err(|_| ProcessorError::LockPoisoned)?;
            for (offset, block) in blocks.iter().enumerate() {
                if *self.shutdown.borrow() {
                    break;
                }
                self.chain.advance_block(start + offset as u32, block)?;
                applied += 1;
            }
        }
        if applied > 0 {
            log_info!(
                "indexed blocks {}..={} of {} in {:.2?} ({} transactions, {} pending items, ~{} KiB cached)",
                start,
                start + applied - 1,
                upstream_height,
                started.elapsed(),
                self.chain.tx_count(),
                self.chain.pending_items(),
                self.chain.pending_bytes() / 1024
            );
        }

        if self.chain.height() == upstream_height {
            self.state = SyncState::Synced;
            self.set_caught_up(true);
            self.flush_and_publish()?;
            self.chain.finish_first_sync();
        } else if self.chain.should_flush() {
            self.flush_and_publish()?;
        }
        Ok(())
    }

    /// Downloads and checks a batch. `None` means the batch did not form a
    /// chain on top of the local tip and was discarded.
    async fn fetch_blocks(&mut self, start: u32, hashes: &[Hash256]) -> Result<Option<Vec<Block>>, ProcessorError> {
        let daemon = Arc::clone(&self.daemon);
        let backoff = self.config.backoff;
        let mut blocks = Vec::with_capacity(hashes.len());
        let mut total_bytes = 0usize;
        let mut prev = self.chain.tip();
        for (offset, hash) in hashes.iter().enumerate() {
            let height = start + offset as u32;
            let raw = fetch("fetch block", backoff, &mut self.shutdown, || daemon.get_block(hash)).await?;
            let block = Block::consensus_decode(&raw).map_err(|err| {
                ChainStateError::Consistency(format!("upstream block {height} is malformed: {err}"))
            })?;
            let block_hash = block.hash();
            if block_hash != *hash {
                log_debug!("upstream block {height} changed while fetching; retrying");
                return Ok(None);
            }
            if block.header.prev_block != prev {
                if offset == 0 {
                    self.state = SyncState::ReorgCheck;
                }
                log_debug!(
                    "upstream block {height} does not link to {}; discarding batch",
                    hash256_to_hex(&prev)
                );
                return Ok(None);
            }
            prev = block_hash;
            total_bytes += raw.len();
            blocks.push(block);
        }
        self.sizer.observe(total_bytes, blocks.len());
        Ok(Some(blocks))
    }

    async fn handle_reorg(&mut self) -> Result<(), ProcessorError> {
        let daemon = Arc::clone(&self.daemon);
        let fork = reorg::find_fork_point(
            daemon.as_ref(),
            &self.chain,
            self.config.backoff,
            &mut self.shutdown,
        )
        .await?;
        if fork.depth == 0 {
            return Ok(());
        }
        log_warn!(
            "chain reorganisation detected: {} block(s) replaced above height {}",
            fork.depth,
            fork.common_height
        );
        self.rewind_to(fork.common_height)
    }

    /// Rewinds `count` blocks through the reorg path; the next steps resync.
    pub fn force_reorg(&mut self, count: u32) -> Result<(), ProcessorError> {
        let height = self.chain.height();
        if count == 0 || height < 0 {
            return Ok(());
        }
        let target = (i64::from(height) - i64::from(count)).max(-1) as i32;
        log_info!("forcing a {count}-block reorg from height {height} to {target}");
        self.set_caught_up(false);
        self.rewind_to(target)
    }

    fn rewind_to(&mut self, target: i32) -> Result<(), ProcessorError> {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| ProcessorError::LockPoisoned)?;
        reorg::rewind(&mut self.chain, &self.mempool, &self.notifier, target)
    }

    /// Commits the cache, then under the same lock lets the mempool drop what
    /// confirmed before anyone is told about the new blocks.
    fn flush_and_publish(&mut self) -> Result<(), ProcessorError> {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| ProcessorError::LockPoisoned)?;
        match self.chain.flush()? {
            Some(outcome) => announce_commit(&self.mempool, &self.notifier, outcome),
            None => Ok(()),
        }
    }
}

/// Lets the mempool drop what a flush confirmed, then announces the blocks.
/// Callers hold the writer lock.
pub(crate) fn announce_commit<S: KeyValueStore>(
    mempool: &SharedMempool<S>,
    notifier: &Notifier,
    outcome: FlushOutcome,
) -> Result<(), ProcessorError> {
    {
        let mut tracker = mempool.lock().map_err(|_| ProcessorError::LockPoisoned)?;
        tracker.on_blocks_committed(&outcome)?;
    }
    publish_blocks(notifier, outcome);
    Ok(())
}

/// One `NewBlock` per committed block; the last carries the flush's touched set.
fn publish_blocks(notifier: &Notifier, outcome: FlushOutcome) {
    let touched = Arc::new(outcome.touched);
    let empty = Arc::new(HashSet::new());
    let last = outcome.blocks.len().saturating_sub(1);
    for (position, (height, hash)) in outcome.blocks.into_iter().enumerate() {
        notifier.send(Notification::NewBlock {
            height: height as i32,
            hash,
            touched: if position == last {
                Arc::clone(&touched)
            } else {
                Arc::clone(&empty)
            },
        });
    }
}
