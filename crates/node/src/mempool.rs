//! Unconfirmed transactions layered over the committed index.
//!
//! The tracker is owned by the writer role. Readers never see it directly: each
//! pass ends by publishing an immutable [`MempoolSnapshot`] through a watch
//! channel.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashxd_chainstate::{ChainStateError, ChainView, FlushOutcome};
use hashxd_primitives::{hash256_to_hex, Hash256, HashX, OutPoint, Transaction};
use hashxd_storage::KeyValueStore;
use tokio::sync::watch;

use crate::daemon::{Daemon, DaemonError};
use crate::notify::{Notification, Notifier};

pub type SharedMempool<S> = Arc<Mutex<MempoolTracker<S>>>;

/// What happens when two mempool transactions spend the same output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConflictPolicy {
    /// The first-seen spender stays; later ones are dropped.
    KeepFirst,
    /// Every transaction in the conflict is dropped.
    DropBoth,
}

impl ConflictPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "keep-first" | "keepfirst" | "first" => Some(Self::KeepFirst),
            "drop-both" | "dropboth" | "both" => Some(Self::DropBoth),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepFirst => "keep-first",
            Self::DropBoth => "drop-both",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolEvent {
    TxAdded { txid: Hash256, fee: i64, size: usize },
    /// Left the mempool because a committed block contains it.
    TxConfirmed { txid: Hash256 },
    /// Left the upstream mempool, or lost an input it depended on.
    TxEvicted { txid: Hash256 },
    /// Dropped because it spends an output `with` also spends.
    TxConflicted { txid: Hash256, with: Hash256 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MempoolInput {
    pub outpoint: OutPoint,
    pub hashx: HashX,
    pub value: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MempoolOutput {
    pub index: u32,
    pub hashx: HashX,
    pub value: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MempoolUtxo {
    pub outpoint: OutPoint,
    pub value: i64,
}

#[derive(Clone, Debug)]
pub struct MempoolTx {
    pub txid: Hash256,
    pub raw: Vec<u8>,
    pub fee: i64,
    /// Unix seconds when this node first saw the transaction.
    pub first_seen: u64,
    pub inputs: Vec<MempoolInput>,
    /// Indexed outputs only; `OP_RETURN` outputs are skipped.
    pub outputs: Vec<MempoolOutput>,
}

impl MempoolTx {
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    fn hashxs(&self) -> BTreeSet<HashX> {
        self.inputs
            .iter()
            .map(|input| input.hashx)
            .chain(self.outputs.iter().map(|output| output.hashx))
            .collect()
    }

    /// Net effect of this transaction on the balance of `hashx`.
    pub fn delta_for(&self, hashx: &HashX) -> i64 {
        let received: i64 = self
            .outputs
            .iter()
            .filter(|output| output.hashx == *hashx)
            .map(|output| output.value)
            .sum();
        let spent: i64 = self
            .inputs
            .iter()
            .filter(|input| input.hashx == *hashx)
            .map(|input| input.value)
            .sum();
        received - spent
    }
}

#[derive(Clone, Default)]
struct Pool {
    txs: HashMap<Hash256, Arc<MempoolTx>>,
    /// Output -> the one mempool transaction allowed to spend it.
    spends: HashMap<OutPoint, Hash256>,
    parents: HashMap<Hash256, BTreeSet<Hash256>>,
    children: HashMap<Hash256, BTreeSet<Hash256>>,
    by_hashx: HashMap<HashX, BTreeSet<Hash256>>,
}

impl Pool {
    fn insert(&mut self, tx: MempoolTx) {
        let txid = tx.txid;
        let mut parents = BTreeSet::new();
        for input in &tx.inputs {
            self.spends.insert(input.outpoint, txid);
            if self.txs.contains_key(&input.outpoint.txid) {
                parents.insert(input.outpoint.txid);
            }
        }
        for parent in &parents {
            self.children.entry(*parent).or_default().insert(txid);
        }
        for hashx in tx.hashxs() {
            self.by_hashx.entry(hashx).or_default().insert(txid);
        }
        self.parents.insert(txid, parents);
        self.txs.insert(txid, Arc::new(tx));
    }

    fn remove(&mut self, txid: &Hash256) -> Option<Arc<MempoolTx>> {
        let tx = self.txs.remove(txid)?;
        for input in &tx.inputs {
            if self.spends.get(&input.outpoint) == Some(txid) {
                self.spends.remove(&input.outpoint);
            }
        }
        for parent in self.parents.remove(txid).unwrap_or_default() {
            if let Some(children) = self.children.get_mut(&parent) {
                children.remove(txid);
                if children.is_empty() {
                    self.children.remove(&parent);
                }
            }
        }
        for child in self.children.remove(txid).unwrap_or_default() {
            if let Some(parents) = self.parents.get_mut(&child) {
                parents.remove(txid);
            }
        }
        for hashx in tx.hashxs() {
            if let Some(txids) = self.by_hashx.get_mut(&hashx) {
                txids.remove(txid);
                if txids.is_empty() {
                    self.by_hashx.remove(&hashx);
                }
            }
        }
        Some(tx)
    }

    /// `txid` followed by everything spending its outputs, parents first.
    fn with_descendants(&self, txid: &Hash256) -> Vec<Hash256> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*txid]);
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) || !self.txs.contains_key(&next) {
                continue;
            }
            out.push(next);
            if let Some(children) = self.children.get(&next) {
                queue.extend(children.iter().copied());
            }
        }
        out
    }

    fn balance_delta(&self, hashx: &HashX) -> i64 {
        let Some(txids) = self.by_hashx.get(hashx) else {
            return 0;
        };
        txids
            .iter()
            .filter_map(|txid| self.txs.get(txid))
            .map(|tx| tx.delta_for(hashx))
            .sum()
    }
}

/// An immutable view of the mempool as of one tracker pass.
#[derive(Clone)]
pub struct MempoolSnapshot {
    height: i32,
    revision: u64,
    pool: Pool,
}

impl MempoolSnapshot {
    fn empty(height: i32) -> Self {
        Self {
            height,
            revision: 0,
            pool: Pool::default(),
        }
    }

    /// Committed height the snapshot was reconciled against.
    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.pool.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.txs.is_empty()
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Arc<MempoolTx>> {
        self.pool.txs.get(txid)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.pool.txs.contains_key(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.pool.spends.get(outpoint).copied()
    }

    /// Transactions touching `hashx`, oldest first.
    pub fn transactions(&self, hashx: &HashX) -> Vec<Arc<MempoolTx>> {
        let Some(txids) = self.pool.by_hashx.get(hashx) else {
            return Vec::new();
        };
        let mut txs: Vec<Arc<MempoolTx>> = txids
            .iter()
            .filter_map(|txid| self.pool.txs.get(txid).cloned())
            .collect();
        txs.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.txid.cmp(&b.txid)));
        txs
    }

    pub fn balance_delta(&self, hashx: &HashX) -> i64 {
        self.pool.balance_delta(hashx)
    }

    /// Mempool outputs paying `hashx` that no other mempool transaction spends.
    pub fn unspent_outputs(&self, hashx: &HashX) -> Vec<MempoolUtxo> {
        let mut out = Vec::new();
        for tx in self.transactions(hashx) {
            for output in tx.outputs.iter().filter(|output| output.hashx == *hashx) {
                let outpoint = OutPoint::new(tx.txid, output.index);
                if !self.pool.spends.contains_key(&outpoint) {
                    out.push(MempoolUtxo {
                        outpoint,
                        value: output.value,
                    });
                }
            }
        }
        out
    }
}

/// Counts from one reconciliation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MempoolPass {
    pub added: usize,
    pub confirmed: usize,
    pub evicted: usize,
    pub conflicted: usize,
    pub rejected: usize,
    pub orphans: usize,
    pub tracked: usize,
}

impl MempoolPass {
    fn is_quiet(&self) -> bool {
        self.added == 0
            && self.confirmed == 0
            && self.evicted == 0
            && self.conflicted == 0
            && self.rejected == 0
    }
}

#[derive(Clone)]
struct Candidate {
    txid: Hash256,
    tx: Transaction,
    raw: Vec<u8>,
    first_seen: u64,
}

enum Admission {
    Added,
    Orphaned,
    Conflicted,
    Rejected,
}

#[derive(Default)]
struct Changes {
    /// Balance delta of every touched hashX before this pass modified it.
    before: HashMap<HashX, i64>,
    events: Vec<MempoolEvent>,
}

impl Changes {
    fn note(&mut self, pool: &Pool, tx: &MempoolTx) {
        for hashx in tx.hashxs() {
            self.before
                .entry(hashx)
                .or_insert_with(|| pool.balance_delta(&hashx));
        }
    }
}

pub struct MempoolTracker<S> {
    view: ChainView<S>,
    policy: ConflictPolicy,
    pool: Pool,
    orphans: HashMap<Hash256, Candidate>,
    /// Malformed or invalid; not refetched while upstream still lists them.
    rejected: HashSet<Hash256>,
    conflicted: HashSet<Hash256>,
    height: i32,
    revision: u64,
    snapshots: watch::Sender<Arc<MempoolSnapshot>>,
    notifier: Notifier,
}

impl<S: KeyValueStore> MempoolTracker<S> {
    pub fn new(
        view: ChainView<S>,
        policy: ConflictPolicy,
        notifier: Notifier,
    ) -> Result<Self, ChainStateError> {
        let height = view.height()?;
        let (snapshots, _) = watch::channel(Arc::new(MempoolSnapshot::empty(height)));
        Ok(Self {
            view,
            policy,
            pool: Pool::default(),
            orphans: HashMap::new(),
            rejected: HashSet::new(),
            conflicted: HashSet::new(),
            height,
            revision: 0,
            snapshots,
            notifier,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MempoolSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> Arc<MempoolSnapshot> {
        Arc::clone(&*self.snapshots.borrow())
    }

    pub fn len(&self) -> usize {
        self.pool.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.txs.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Upstream txids this tracker has no record of and needs raw data for.
    pub fn missing(&self, upstream: &[Hash256]) -> Vec<Hash256> {
        upstream
            .iter()
            .filter(|txid| {
                !self.pool.txs.contains_key(*txid)
                    && !self.orphans.contains_key(*txid)
                    && !self.rejected.contains(*txid)
                    && !self.conflicted.contains(*txid)
            })
            .copied()
            .collect()
    }

    /// Brings the tracked set in line with the upstream txid list. `fetched`
    /// carries raw data for txids reported by [`missing`](Self::missing).
    pub fn reconcile(
        &mut self,
        upstream: &[Hash256],
        fetched: Vec<(Hash256, Vec<u8>)>,
    ) -> Result<MempoolPass, ChainStateError> {
        let upstream: HashSet<Hash256> = upstream.iter().copied().collect();
        self.height = self.view.height()?;
        let mut pass = MempoolPass::default();
        let mut changes = Changes::default();

        let gone: Vec<Hash256> = self
            .pool
            .txs
            .keys()
            .filter(|txid| !upstream.contains(*txid))
            .copied()
            .collect();
        for txid in gone {
            if !self.pool.txs.contains_key(&txid) {
                continue;
            }
            if self.view.tx_num(&txid)?.is_some() {
                self.remove_tx(&txid, &mut changes);
                changes.events.push(MempoolEvent::TxConfirmed { txid });
                pass.confirmed += 1;
            } else {
                for removed in self.evict(&txid, &mut changes) {
                    changes
                        .events
                        .push(MempoolEvent::TxEvicted { txid: removed.txid });
                    pass.evicted += 1;
                }
            }
        }
        self.orphans.retain(|txid, _| upstream.contains(txid));
        self.rejected.retain(|txid| upstream.contains(txid));
        self.conflicted.retain(|txid| upstream.contains(txid));

        let mut candidates: Vec<Candidate> = self.orphans.drain().map(|(_, c)| c).collect();
        let now = unix_now_secs();
        for (txid, raw) in fetched {
            if !upstream.contains(&txid) || self.pool.txs.contains_key(&txid) {
                continue;
            }
            match Transaction::consensus_decode(&raw) {
                Ok(tx) if tx.txid() == txid && !tx.is_coinbase() => candidates.push(Candidate {
                    txid,
                    tx,
                    raw,
                    first_seen: now,
                }),
                Ok(_) => {
                    log_debug!("mempool tx {} does not match its raw data", hash256_to_hex(&txid));
                    self.rejected.insert(txid);
                    pass.rejected += 1;
                }
                Err(err) => {
                    log_debug!("mempool tx {} is malformed: {err}", hash256_to_hex(&txid));
                    self.rejected.insert(txid);
                    pass.rejected += 1;
                }
            }
        }
        self.admit(candidates, &mut pass, &mut changes)?;

        pass.orphans = self.orphans.len();
        pass.tracked = self.pool.txs.len();
        self.publish(changes);
        Ok(pass)
    }

    /// Drops transactions confirmed by a flush, then re-resolves the rest
    /// against the newly committed state. Runs under the writer lock right
    /// after the flush, so no reader sees a transaction in both places.
    pub fn on_blocks_committed(
        &mut self,
        outcome: &FlushOutcome,
    ) -> Result<MempoolPass, ChainStateError> {
        let mut pass = MempoolPass::default();
        let mut changes = Changes::default();
        for txid in &outcome.confirmed {
            if self.remove_tx(txid, &mut changes).is_some() {
                changes.events.push(MempoolEvent::TxConfirmed { txid: *txid });
                pass.confirmed += 1;
            }
            self.orphans.remove(txid);
        }
        self.height = outcome.height;
        self.revalidate_inner(&mut pass, &mut changes)?;
        pass.orphans = self.orphans.len();
        pass.tracked = self.pool.txs.len();
        self.publish(changes);
        Ok(pass)
    }

    /// Re-resolves every tracked transaction, e.g. after a rewind.
    pub fn revalidate(&mut self) -> Result<MempoolPass, ChainStateError> {
        let mut pass = MempoolPass::default();
        let mut changes = Changes::default();
        self.height = self.view.height()?;
        self.revalidate_inner(&mut pass, &mut changes)?;
        pass.orphans = self.orphans.len();
        pass.tracked = self.pool.txs.len();
        self.publish(changes);
        Ok(pass)
    }

    fn revalidate_inner(
        &mut self,
        pass: &mut MempoolPass,
        changes: &mut Changes,
    ) -> Result<(), ChainStateError> {
        let txids: Vec<Hash256> = self.pool.txs.keys().copied().collect();
        for txid in txids {
            let Some(tx) = self.pool.txs.get(&txid).cloned() else {
                continue;
            };
            if self.inputs_resolve(&tx)? {
                continue;
            }
            for removed in self.evict(&txid, changes) {
                changes
                    .events
                    .push(MempoolEvent::TxEvicted { txid: removed.txid });
                pass.evicted += 1;
                if let Ok(parsed) = Transaction::consensus_decode(&removed.raw) {
                    self.orphans.insert(
                        removed.txid,
                        Candidate {
                            txid: removed.txid,
                            tx: parsed,
                            raw: removed.raw.clone(),
                            first_seen: removed.first_seen,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn inputs_resolve(&self, tx: &MempoolTx) -> Result<bool, ChainStateError> {
        for input in &tx.inputs {
            if self.pool.txs.contains_key(&input.outpoint.txid) {
                continue;
            }
            match self.view.lookup_utxo(&input.outpoint)? {
                Some(record) if record.hashx == input.hashx && record.value == input.value => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn admit(
        &mut self,
        candidates: Vec<Candidate>,
        pass: &mut MempoolPass,
        changes: &mut Changes,
    ) -> Result<(), ChainStateError> {
        let (ordered, cyclic) = order_parents_first(candidates);
        for candidate in cyclic {
            log_warn!(
                "mempool tx {} is in or depends on a spend cycle; ignored",
                hash256_to_hex(&candidate.txid)
            );
            self.rejected.insert(candidate.txid);
            pass.rejected += 1;
        }
        for candidate in ordered {
            if self.view.tx_num(&candidate.txid)?.is_some() {
                continue;
            }
            match self.try_accept(candidate, changes)? {
                Admission::Added => pass.added += 1,
                Admission::Conflicted => pass.conflicted += 1,
                Admission::Rejected => pass.rejected += 1,
                Admission::Orphaned => {}
            }
        }
        Ok(())
    }

    fn try_accept(
        &mut self,
        candidate: Candidate,
        changes: &mut Changes,
    ) -> Result<Admission, ChainStateError> {
        let txid = candidate.txid;
        let mut seen = HashSet::new();
        let mut conflicts = BTreeSet::new();
        for input in &candidate.tx.inputs {
            if !seen.insert(input.prevout) {
                self.rejected.insert(txid);
                return Ok(Admission::Rejected);
            }
            if let Some(spender) = self.pool.spends.get(&input.prevout) {
                conflicts.insert(*spender);
            }
        }
        if !conflicts.is_empty() {
            self.resolve_conflict(txid, conflicts, changes);
            return Ok(Admission::Conflicted);
        }

        let mut inputs = Vec::with_capacity(candidate.tx.inputs.len());
        let mut unresolved = false;
        for input in &candidate.tx.inputs {
            let prevout = input.prevout;
            let parent_output = self.pool.txs.get(&prevout.txid).map(|parent| {
                parent
                    .outputs
                    .iter()
                    .find(|output| output.index == prevout.index)
                    .copied()
            });
            match parent_output {
                Some(Some(output)) => inputs.push(MempoolInput {
                    outpoint: prevout,
                    hashx: output.hashx,
                    value: output.value,
                }),
                Some(None) => {
                    self.rejected.insert(txid);
                    return Ok(Admission::Rejected);
                }
                None => match self.view.lookup_utxo(&prevout)? {
                    Some(record) => inputs.push(MempoolInput {
                        outpoint: prevout,
                        hashx: record.hashx,
                        value: record.value,
                    }),
                    None => {
                        unresolved = true;
                        break;
                    }
                },
            }
        }
        if unresolved {
            self.orphans.insert(txid, candidate);
            return Ok(Admission::Orphaned);
        }

        let value_in = inputs
            .iter()
            .try_fold(0i64, |total, input| total.checked_add(input.value));
        let fee = match (value_in, candidate.tx.output_total()) {
            (Some(value_in), Some(value_out)) if value_in >= value_out => value_in - value_out,
            _ => {
                log_debug!("mempool tx {} spends more than its inputs", hash256_to_hex(&txid));
                self.rejected.insert(txid);
                return Ok(Admission::Rejected);
            }
        };
        let outputs = candidate
            .tx
            .outputs
            .iter()
            .enumerate()
            .filter_map(|(index, output)| {
                HashX::from_script(&output.script_pubkey).map(|hashx| MempoolOutput {
                    index: index as u32,
                    hashx,
                    value: output.value,
                })
            })
            .collect();
        let tx = MempoolTx {
            txid,
            raw: candidate.raw,
            fee,
            first_seen: candidate.first_seen,
            inputs,
            outputs,
        };
        changes.note(&self.pool, &tx);
        changes.events.push(MempoolEvent::TxAdded {
            txid,
            fee,
            size: tx.size(),
        });
        self.pool.insert(tx);
        Ok(Admission::Added)
    }

    fn resolve_conflict(&mut self, txid: Hash256, conflicts: BTreeSet<Hash256>, changes: &mut Changes) {
        self.conflicted.insert(txid);
        for other in conflicts {
            log_info!(
                "mempool double spend: {} conflicts with {} ({})",
                hash256_to_hex(&txid),
                hash256_to_hex(&other),
                self.policy.as_str()
            );
            changes
                .events
                .push(MempoolEvent::TxConflicted { txid, with: other });
            if self.policy == ConflictPolicy::DropBoth {
                for removed in self.evict(&other, changes) {
                    if removed.txid == other {
                        self.conflicted.insert(other);
                        changes
                            .events
                            .push(MempoolEvent::TxConflicted { txid: other, with: txid });
                    } else {
                        changes
                            .events
                            .push(MempoolEvent::TxEvicted { txid: removed.txid });
                    }
                }
            }
        }
    }

    fn remove_tx(&mut self, txid: &Hash256, changes: &mut Changes) -> Option<Arc<MempoolTx>> {
        let tx = self.pool.txs.get(txid).cloned()?;
        changes.note(&self.pool, &tx);
        self.pool.remove(txid)
    }

    fn evict(&mut self, txid: &Hash256, changes: &mut Changes) -> Vec<Arc<MempoolTx>> {
        self.pool
            .with_descendants(txid)
            .iter()
            .filter_map(|doomed| self.remove_tx(doomed, changes))
            .collect()
    }

    fn publish(&mut self, changes: Changes) {
        self.revision += 1;
        self.snapshots.send_replace(Arc::new(MempoolSnapshot {
            height: self.height,
            revision: self.revision,
            pool: self.pool.clone(),
        }));
        for event in changes.events {
            self.notifier.send(Notification::Tx(event));
        }
        let mut changed: Vec<(HashX, i64)> = changes
            .before
            .into_iter()
            .filter_map(|(hashx, before)| {
                let now = self.pool.balance_delta(&hashx);
                (now != before).then_some((hashx, now))
            })
            .collect();
        changed.sort();
        for (hashx, unconfirmed) in changed {
            self.notifier
                .send(Notification::HashXChanged { hashx, unconfirmed });
        }
    }
}

/// Kahn's algorithm over the spend edges between candidates. Returns the
/// candidates parents-first, and separately those in or behind a cycle.
fn order_parents_first(candidates: Vec<Candidate>) -> (Vec<Candidate>, Vec<Candidate>) {
    let index: HashMap<Hash256, usize> = candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| (candidate.txid, position))
        .collect();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); candidates.len()];
    let mut indegree = vec![0usize; candidates.len()];
    for (position, candidate) in candidates.iter().enumerate() {
        let parents: BTreeSet<usize> = candidate
            .tx
            .inputs
            .iter()
            .filter_map(|input| index.get(&input.prevout.txid).copied())
            .collect();
        for parent in parents {
            children[parent].push(position);
            indegree[position] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..candidates.len())
        .filter(|position| indegree[*position] == 0)
        .collect();
    let mut order = Vec::with_capacity(candidates.len());
    while let Some(position) = queue.pop_front() {
        order.push(position);
        for &child in &children[position] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
    let ordered = order
        .iter()
        .filter_map(|position| slots[*position].take())
        .collect();
    let cyclic = slots.into_iter().flatten().collect();
    (ordered, cyclic)
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug)]
pub enum MempoolSyncError {
    Daemon(DaemonError),
    Chain(ChainStateError),
    LockPoisoned,
}

impl fmt::Display for MempoolSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MempoolSyncError::Daemon(err) => write!(f, "{err}"),
            MempoolSyncError::Chain(err) => write!(f, "{err}"),
            MempoolSyncError::LockPoisoned => write!(f, "mempool lock poisoned"),
        }
    }
}

impl std::error::Error for MempoolSyncError {}

impl From<DaemonError> for MempoolSyncError {
    fn from(err: DaemonError) -> Self {
        MempoolSyncError::Daemon(err)
    }
}

impl From<ChainStateError> for MempoolSyncError {
    fn from(err: ChainStateError) -> Self {
        MempoolSyncError::Chain(err)
    }
}

/// One resync pass: fetch without any lock held, reconcile under the writer lock.
pub async fn sync_once<D: Daemon, S: KeyValueStore>(
    daemon: &D,
    tracker: &SharedMempool<S>,
    writer: &Mutex<()>,
) -> Result<MempoolPass, MempoolSyncError> {
    let upstream = daemon.mempool_txids().await?;
    let missing = {
        let guard = tracker.lock().map_err(|_| MempoolSyncError::LockPoisoned)?;
        guard.missing(&upstream)
    };
    let mut fetched = Vec::with_capacity(missing.len());
    for txid in missing {
        if let Some(raw) = daemon.raw_transaction(&txid).await? {
            fetched.push((txid, raw));
        }
    }

    let _guard = writer.lock().map_err(|_| MempoolSyncError::LockPoisoned)?;
    let mut tracker = tracker.lock().map_err(|_| MempoolSyncError::LockPoisoned)?;
    Ok(tracker.reconcile(&upstream, fetched)?)
}

/// Polls the upstream mempool while the block processor is caught up.
pub async fn run<D: Daemon, S: KeyValueStore>(
    daemon: Arc<D>,
    tracker: SharedMempool<S>,
    writer: Arc<Mutex<()>>,
    mut caught_up: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let synced = *caught_up.borrow();
        if synced {
            match sync_once(daemon.as_ref(), &tracker, &writer).await {
                Ok(pass) if pass.is_quiet() => {
                    log_debug!("mempool unchanged ({} tracked)", pass.tracked);
                }
                Ok(pass) => log_info!(
                    "mempool: +{} added, {} confirmed, {} evicted, {} conflicted, {} rejected; {} tracked, {} orphans",
                    pass.added,
                    pass.confirmed,
                    pass.evicted,
                    pass.conflicted,
                    pass.rejected,
                    pass.tracked,
                    pass.orphans
                ),
                Err(MempoolSyncError::LockPoisoned) => {
                    log_error!("mempool tracker stopped: lock poisoned");
                    break;
                }
                Err(err) => log_warn!("mempool refresh failed: {err}"),
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = caught_up.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use hashxd_chainstate::ChainState;
    use hashxd_storage::memory::MemoryStore;

    struct Fixture {
        chain: ChainState<MemoryStore>,
        tracker: MempoolTracker<MemoryStore>,
        notifier: Notifier,
        /// Confirmed outputs paying tag 1, 50 each.
        funding: Vec<OutPoint>,
    }

    fn fixture(policy: ConflictPolicy) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut chain = open_chain(&store, 10);
        let blocks = coinbase_chain([0u8; 32], 0, 4, 1, 0);
        apply_all(&mut chain, 0, &blocks);
        chain.flush().expect("flush");
        let funding = blocks
            .iter()
            .map(|block| OutPoint::new(block.transactions[0].txid(), 0))
            .collect();
        let notifier = Notifier::new();
        let tracker =
            MempoolTracker::new(chain.view(), policy, notifier.clone()).expect("tracker");
        Fixture {
            chain,
            tracker,
            notifier,
            funding,
        }
    }

    fn raw(tx: &Transaction) -> (Hash256, Vec<u8>) {
        (tx.txid(), tx.consensus_encode())
    }

    fn ids(txs: &[&Transaction]) -> Vec<Hash256> {
        txs.iter().map(|tx| tx.txid()).collect()
    }

    #[test]
    fn chained_transactions_are_accepted_in_any_arrival_order() {
        let mut fx = fixture(ConflictPolicy::KeepFirst);
        let parent = spend(&[fx.funding[0]], &[(2, 40)]);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], &[(3, 35)]);
        let upstream = ids(&[&parent, &child]);

        let pass = fx
            .tracker
            .reconcile(&upstream, vec![raw(&child), raw(&parent)])
            .expect("reconcile");
        assert_eq!(pass.added, 2);
        assert_eq!(pass.orphans, 0);

        let snapshot = fx.tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&parent.txid()).expect("parent").fee, 10);
        assert_eq!(snapshot.get(&child.txid()).expect("child").fee, 5);
        assert_eq!(snapshot.balance_delta(&hashx(1)), -50);
        assert_eq!(snapshot.balance_delta(&hashx(2)), 0);
        assert_eq!(snapshot.balance_delta(&hashx(3)), 35);
        assert!(snapshot.unspent_outputs(&hashx(2)).is_empty());
        assert_eq!(
            snapshot.spender(&OutPoint::new(parent.txid(), 0)),
            Some(child.txid())
        );
    }

    #[test]
    fn keep_first_drops_the_later_double_spend() {
        let mut fx = fixture(ConflictPolicy::KeepFirst);
        let mut events = fx.notifier.subscribe();
        let first = spend(&[fx.funding[0]], &[(2, 45)]);
        fx.tracker
            .reconcile(&ids(&[&first]), vec![raw(&first)])
            .expect("first pass");
        let second = spend(&[fx.funding[0]], &[(3, 44)]);
        let pass = fx
            .tracker
            .reconcile(&ids(&[&first, &second]), vec![raw(&second)])
            .expect("second pass");
        assert_eq!(pass.conflicted, 1);

        let snapshot = fx.tracker.snapshot();
        assert!(snapshot.contains(&first.txid()));
        assert!(!snapshot.contains(&second.txid()));
        assert_eq!(snapshot.spender(&fx.funding[0]), Some(first.txid()));
        assert!(fx
            .tracker
            .missing(&ids(&[&first, &second]))
            .is_empty());

        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            if let Notification::Tx(MempoolEvent::TxConflicted { txid, with }) = event {
                assert_eq!((txid, with), (second.txid(), first.txid()));
                saw_conflict = true;
            }
        }
        assert!(saw_conflict);
    }

    #[test]
    fn drop_both_removes_every_conflicting_spend_and_its_children() {
        let mut fx = fixture(ConflictPolicy::DropBoth);
        let first = spend(&[fx.funding[0]], &[(2, 45)]);
        let child = spend(&[OutPoint::new(first.txid(), 0)], &[(4, 40)]);
        fx.tracker
            .reconcile(&ids(&[&first, &child]), vec![raw(&first), raw(&child)])
            .expect("first pass");
        let second = spend(&[fx.funding[0]], &[(3, 44)]);
        fx.tracker
            .reconcile(&ids(&[&first, &child, &second]), vec![raw(&second)])
            .expect("second pass");

        let snapshot = fx.tracker.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.spender(&fx.funding[0]), None);
        assert_eq!(snapshot.balance_delta(&hashx(1)), 0);
    }

    #[test]
    fn orphan_is_admitted_once_its_parent_appears() {
        let mut fx = fixture(ConflictPolicy::KeepFirst);
        let parent = spend(&[fx.funding[1]], &[(2, 40)]);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], &[(3, 30)]);

        let pass = fx
            .tracker
            .reconcile(&ids(&[&child]), vec![raw(&child)])
            .expect("orphan pass");
        assert_eq!(pass.added, 0);
        assert_eq!(pass.orphans, 1);
        assert!(fx.tracker.missing(&ids(&[&child])).is_empty());

        let pass = fx
            .tracker
            .reconcile(&ids(&[&parent, &child]), vec![raw(&parent)])
            .expect("parent pass");
        assert_eq!(pass.added, 2);
        assert_eq!(pass.orphans, 0);
    }

    #[test]
    fn malformed_data_is_remembered_as_rejected() {
        let mut fx = fixture(ConflictPolicy::KeepFirst);
        let bogus = [7u8; 32];
        let pass = fx
            .tracker
            .reconcile(&[bogus], vec![(bogus, vec![1, 2, 3])])
            .expect("reconcile");
        assert_eq!(pass.rejected, 1);
        assert!(fx.tracker.missing(&[bogus]).is_empty());
        fx.tracker.reconcile(&[], Vec::new()).expect("drop");
        assert_eq!(fx.tracker.missing(&[bogus]), vec![bogus]);
    }

    #[test]
    fn transactions_leaving_upstream_are_evicted_with_descendants() {
        let mut fx = fixture(ConflictPolicy::KeepFirst);
        let parent = spend(&[fx.funding[0]], &[(2, 40)]);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], &[(3, 30)]);
        let other = spend(&[fx.funding[2]], &[(4, 49)]);
        fx.tracker
            .reconcile(
                &ids(&[&parent, &child, &other]),
                vec![raw(&parent), raw(&child), raw(&other)],
            )
            .expect("first pass");
        let pass = fx
            .tracker
            .reconcile(&ids(&[&child, &other]), Vec::new())
            .expect("second pass");
        assert_eq!(pass.evicted, 2);
        let snapshot = fx.tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&other.txid()));
    }

    #[test]
    fn cycles_are_excluded_from_ordering() {
        let a_id = [0xa1; 32];
        let b_id = [0xb2; 32];
        let c_id = [0xc3; 32];
        let candidate = |txid: Hash256, spends: Hash256| Candidate {
            txid,
            tx: spend(&[OutPoint::new(spends, 0)], &[(1, 1)]),
            raw: Vec::new(),
            first_seen: 0,
        };
        let candidates = vec![
            candidate(a_id, b_id),
            candidate(b_id, a_id),
            candidate(c_id, [0x99; 32]),
        ];
        let (ordered, cyclic) = order_parents_first(candidates);
        assert_eq!(
            ordered.iter().map(|c| c.txid).collect::<Vec<_>>(),
            vec![c_id]
        );
        let mut cyclic: Vec<Hash256> = cyclic.iter().map(|c| c.txid).collect();
        cyclic.sort();
        assert_eq!(cyclic, vec![a_id, b_id]);
    }

    #[test]
    fn parents_sort_before_children() {
        let parent = spend(&[OutPoint::new([1u8; 32], 0)], &[(1, 10)]);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], &[(1, 9)]);
        let grandchild = spend(&[OutPoint::new(child.txid(), 0)], &[(1, 8)]);
        let as_candidate = |tx: &Transaction| Candidate {
            txid: tx.txid(),
            tx: tx.clone(),
            raw: Vec::new(),
            first_seen: 0,
        };
        let (ordered, cyclic) = order_parents_first(vec![
            as_candidate(&grandchild),
            as_candidate(&parent),
            as_candidate(&child),
        ]);
        assert!(cyclic.is_empty());
        assert_eq!(
            ordered.iter().map(|c| c.txid).collect::<Vec<_>>(),
            vec![parent.txid(), child.txid(), grandchild.txid()]
        );
    }

    #[test]
    fn confirmation_moves_a_transaction_from_mempool_to_the_index() {
        let mut fx = fixture(ConflictPolicy::KeepFirst);
        let tx = spend(&[fx.funding[0]], &[(2, 48)]);
        let child = spend(&[OutPoint::new(tx.txid(), 0)], &[(3, 47)]);
        fx.tracker
            .reconcile(&ids(&[&tx, &child]), vec![raw(&tx), raw(&child)])
            .expect("reconcile");
        assert_eq!(fx.tracker.snapshot().balance_delta(&hashx(2)), 0);

        let tip = fx.chain.tip();
        let block = make_block(tip, 4, 7, vec![coinbase(4, 7, &[(9, 50)]), tx.clone()]);
        fx.chain.advance_block(4, &block).expect("advance");
        let outcome = fx.chain.flush().expect("flush").expect("outcome");
        let pass = fx.tracker.on_blocks_committed(&outcome).expect("commit");
        assert_eq!(pass.confirmed, 1);
        assert_eq!(pass.evicted, 0);

        let view = fx.chain.view();
        let snapshot = fx.tracker.snapshot();
        assert_eq!(snapshot.height(), 4);
        assert!(!snapshot.contains(&tx.txid()));
        assert!(snapshot.contains(&child.txid()));
        assert_eq!(view.balance(&hashx(2)).expect("balance"), 48);
        assert_eq!(snapshot.balance_delta(&hashx(2)), -48);
        assert!(view.tx_num(&tx.txid()).expect("tx num").is_some());
    }

    #[test]
    fn spends_invalidated_by_a_block_become_orphans() {
        let mut fx = fixture(ConflictPolicy::KeepFirst);
        let pooled = spend(&[fx.funding[0]], &[(2, 48)]);
        fx.tracker
            .reconcile(&ids(&[&pooled]), vec![raw(&pooled)])
            .expect("reconcile");

        let rival = spend(&[fx.funding[0]], &[(3, 49)]);
        let tip = fx.chain.tip();
        let block = make_block(tip, 4, 8, vec![coinbase(4, 8, &[(9, 50)]), rival]);
        fx.chain.advance_block(4, &block).expect("advance");
        let outcome = fx.chain.flush().expect("flush").expect("outcome");
        let pass = fx.tracker.on_blocks_committed(&outcome).expect("commit");
        assert_eq!(pass.evicted, 1);
        assert_eq!(pass.orphans, 1);
        assert!(fx.tracker.is_empty());
    }
}
