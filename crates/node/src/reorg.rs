//! Fork detection against the upstream chain and rewinds through undo records.

use std::collections::HashSet;
use std::sync::Arc;

use hashxd_chainstate::{ChainState, ChainStateError};
use hashxd_primitives::{hash256_to_hex, Hash256};
use hashxd_storage::KeyValueStore;
use tokio::sync::watch;

use crate::block_processor::{announce_commit, fetch, ProcessorError};
use crate::daemon::{Backoff, Daemon};
use crate::mempool::SharedMempool;
use crate::notify::{Notification, Notifier};

/// Most blocks undone in one atomic batch.
pub const REWIND_CHUNK: u32 = 50;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ForkPoint {
    /// Highest height where local and upstream agree; `-1` when even genesis differs.
    pub common_height: i32,
    /// Local blocks above the common height.
    pub depth: u32,
}

/// Length of the common prefix of two hash runs.
pub fn diff_pos(local: &[Hash256], upstream: &[Hash256]) -> usize {
    local
        .iter()
        .zip(upstream)
        .take_while(|(ours, theirs)| ours == theirs)
        .count()
}

/// Walks down from the tip in doubling windows until local and upstream
/// hashes agree. Never looks below the retained undo window.
pub async fn find_fork_point<D: Daemon, S: KeyValueStore>(
    daemon: &D,
    chain: &ChainState<S>,
    backoff: Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ForkPoint, ProcessorError> {
    let height = chain.height();
    if height < 0 {
        return Ok(ForkPoint {
            common_height: -1,
            depth: 0,
        });
    }
    let tip_height = height as u32;
    let upstream_tip = fetch("fetch upstream block hash", backoff, shutdown, || {
        daemon.block_hash(tip_height)
    })
    .await?;
    if upstream_tip == Some(chain.tip()) {
        return Ok(ForkPoint {
            common_height: height,
            depth: 0,
        });
    }

    let min_height = chain.min_rewind_height();
    let floor = i64::from(min_height.max(0));
    let mut end = i64::from(height);
    let mut count: i64 = 1;
    let first_replaced = loop {
        let start = (end - count).max(floor);
        if start >= end {
            if floor == 0 && min_height < 0 {
                break 0;
            }
            return Err(ChainStateError::ForkTooDeep {
                fork_height: (floor - 1) as i32,
                min_height,
            }
            .into());
        }
        let window = (end - start) as u32;
        let local = chain.block_hashes(start as u32, window)?;
        let upstream = fetch("fetch upstream block hashes", backoff, shutdown, || {
            daemon.block_hashes(start as u32, window)
        })
        .await?;
        let matched = diff_pos(&local, &upstream) as i64;
        if matched > 0 {
            break start + matched;
        }
        end = start;
        count = count.saturating_mul(2);
    };

    let common_height = (first_replaced - 1) as i32;
    log_info!(
        "fork point at height {common_height}; local tip {} at {height} is not on the upstream chain",
        hash256_to_hex(&chain.tip())
    );
    Ok(ForkPoint {
        common_height,
        depth: (i64::from(height) - first_replaced + 1) as u32,
    })
}

/// Rewinds to `target` in chunks, then re-resolves the mempool against the
/// new committed state. Callers hold the writer lock.
///
/// Blocks still in the write-back cache are committed and announced first,
/// so subscribers see every `NewBlock` the later `Rewound` takes back.
pub fn rewind<S: KeyValueStore>(
    chain: &mut ChainState<S>,
    mempool: &SharedMempool<S>,
    notifier: &Notifier,
    target: i32,
) -> Result<(), ProcessorError> {
    let from = chain.height();
    if target >= from {
        return Ok(());
    }
    let min_height = chain.min_rewind_height();
    if target < min_height {
        return Err(ChainStateError::ForkTooDeep {
            fork_height: target,
            min_height,
        }
        .into());
    }

    if let Some(outcome) = chain.flush()? {
        announce_commit(mempool, notifier, outcome)?;
    }

    let mut touched = HashSet::new();
    let mut undone = 0usize;
    while chain.height() > target {
        let next = (chain.height() - REWIND_CHUNK as i32).max(target);
        let mut outcome = chain.rewind_to(next)?;
        if let Some(flushed) = outcome.flushed.take() {
            announce_commit(mempool, notifier, flushed)?;
        }
        undone += outcome.undone.len();
        touched.extend(outcome.touched);
        log_info!(
            "rewound to height {} ({undone} of {} block(s) undone)",
            outcome.height,
            from - target
        );
    }

    match mempool.lock() {
        Ok(mut tracker) => {
            let pass = tracker.revalidate()?;
            if pass.evicted > 0 {
                log_warn!(
                    "{} mempool transaction(s) lost their inputs in the rewind",
                    pass.evicted
                );
            }
        }
        Err(_) => return Err(ProcessorError::LockPoisoned),
    }
    notifier.send(Notification::Rewound {
        height: chain.height(),
        hash: chain.tip(),
        touched: Arc::new(touched),
    });
    Ok(())
}
