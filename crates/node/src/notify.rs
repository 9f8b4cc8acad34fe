use std::collections::HashSet;
use std::sync::Arc;

use hashxd_primitives::{Hash256, HashX};
use tokio::sync::broadcast;

use crate::mempool::MempoolEvent;

pub const NOTIFY_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub enum Notification {
    /// A flush made blocks up to `height` visible to readers.
    NewBlock {
        height: i32,
        hash: Hash256,
        touched: Arc<HashSet<HashX>>,
    },
    /// A reorg unwound the chain back to `height`; `touched` covers every
    /// script the unwound blocks touched.
    Rewound {
        height: i32,
        hash: Hash256,
        touched: Arc<HashSet<HashX>>,
    },
    /// The mempool-adjusted balance delta of `hashx` changed.
    HashXChanged { hashx: HashX, unconfirmed: i64 },
    Tx(MempoolEvent),
}

/// Fan-out to subscribers. Slow subscribers lag and skip; the writer never blocks.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn send(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
