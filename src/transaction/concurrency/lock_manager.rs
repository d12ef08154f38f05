use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId, INVALID_TXN_ID};
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

/// Lock manager configuration.
pub struct LockManagerConfig {
    /// How often the background detector scans the wait-for graph. Blocked
    /// lock requests also re-check their abort flag at this interval.
    pub cycle_detection_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            cycle_detection_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn_id: TxnId,
    #[allow(dead_code)]
    mode: LockMode,
}

/// Per-RID lock state: one writer slot, a reader set, the FIFO wait queue
/// and the condition variable blocked requests sleep on.
struct RidLockState {
    writer_txn_id: TxnId,
    reader_txn_ids: HashSet<TxnId>,
    request_queue: VecDeque<LockRequest>,
    cv: Arc<Condvar>,
}

impl RidLockState {
    fn new() -> Self {
        Self {
            writer_txn_id: INVALID_TXN_ID,
            reader_txn_ids: HashSet::new(),
            request_queue: VecDeque::new(),
            cv: Arc::new(Condvar::new()),
        }
    }

    /// An entry with no holder and no waiter can be garbage collected.
    fn is_free(&self) -> bool {
        self.writer_txn_id == INVALID_TXN_ID
            && self.reader_txn_ids.is_empty()
            && self.request_queue.is_empty()
    }
}

/// Everything behind the lock manager's single mutex.
struct LockTable {
    rid_locks: HashMap<Rid, RidLockState>,
    /// Wait-for edges (waiter, holder); ordered so graph construction is
    /// deterministic.
    waits_for: BTreeSet<(TxnId, TxnId)>,
    /// Transactions currently blocked in a lock call, kept here so the
    /// detector can abort a victim it picked.
    waiters: HashMap<TxnId, Arc<Transaction>>,
}

struct LockManagerInner {
    table: Mutex<LockTable>,
    interval: Duration,
    running: AtomicBool,
    /// Wakes the detector out of its sleep so shutdown is prompt even with
    /// long detection intervals.
    shutdown: Mutex<()>,
    shutdown_cv: Condvar,
}

/// Row-granularity shared/exclusive lock manager with strict 2PL under
/// REPEATABLE_READ and wait-for-graph deadlock detection.
///
/// Lock calls return `bool`: false means the request was refused or the
/// transaction was aborted (observable through `Transaction::state`).
pub struct LockManager {
    inner: Arc<LockManagerInner>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    pub fn with_config(config: LockManagerConfig) -> Self {
        let inner = Arc::new(LockManagerInner {
            table: Mutex::new(LockTable {
                rid_locks: HashMap::new(),
                waits_for: BTreeSet::new(),
                waiters: HashMap::new(),
            }),
            interval: config.cycle_detection_interval,
            running: AtomicBool::new(true),
            shutdown: Mutex::new(()),
            shutdown_cv: Condvar::new(),
        });

        let detector_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || Self::run_cycle_detection(detector_inner))
            .expect("failed to spawn deadlock detector");

        Self {
            inner,
            detector: Mutex::new(Some(handle)),
        }
    }

    /// Acquire a shared lock on `rid`, blocking while a writer holds it.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let mut table = self.inner.table.lock();

        if !Self::admit(txn) {
            return false;
        }
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            // READ_UNCOMMITTED never takes shared locks; asking for one is a
            // protocol error that aborts the requester.
            txn.set_state(TransactionState::Aborted);
            debug!(
                "txn {} requested a shared lock under READ_UNCOMMITTED",
                txn.id()
            );
            return false;
        }
        if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
            return true;
        }

        let writer = {
            let state = table.rid_locks.entry(rid).or_insert_with(RidLockState::new);
            state.writer_txn_id
        };

        if writer != INVALID_TXN_ID {
            let waited = vec![writer];
            Self::begin_wait(&mut table, txn, rid, LockMode::Shared, &waited);
            let cv = table.rid_locks[&rid].cv.clone();

            loop {
                if table.rid_locks[&rid].writer_txn_id == INVALID_TXN_ID {
                    break;
                }
                if txn.state() == TransactionState::Aborted {
                    Self::end_wait(&mut table, txn.id(), rid, &waited);
                    return false;
                }
                cv.wait_for(&mut table, self.inner.interval);
            }
            // Enter the reader set before the wait bookkeeping is torn down,
            // so the entry can never look free in between.
            table
                .rid_locks
                .get_mut(&rid)
                .expect("lock entry pinned by the request")
                .reader_txn_ids
                .insert(txn.id());
            Self::end_wait(&mut table, txn.id(), rid, &waited);
            txn.add_shared_lock(rid);
            return true;
        }

        table
            .rid_locks
            .get_mut(&rid)
            .expect("lock entry pinned by the request")
            .reader_txn_ids
            .insert(txn.id());
        txn.add_shared_lock(rid);
        true
    }

    /// Acquire an exclusive lock on `rid`: first wait out the writer, claim
    /// the writer slot, then wait for the reader set to drain.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let mut table = self.inner.table.lock();

        if !Self::admit(txn) {
            return false;
        }
        if txn.is_exclusive_locked(rid) {
            return true;
        }
        if txn.is_shared_locked(rid) {
            // Holding S and asking for X is an upgrade.
            drop(table);
            return self.lock_upgrade(txn, rid);
        }

        let mut waited = Vec::new();
        {
            let state = table.rid_locks.entry(rid).or_insert_with(RidLockState::new);
            if state.writer_txn_id != INVALID_TXN_ID {
                waited.push(state.writer_txn_id);
            }
            waited.extend(state.reader_txn_ids.iter().copied());
        }
        Self::begin_wait(&mut table, txn, rid, LockMode::Exclusive, &waited);
        let cv = table.rid_locks[&rid].cv.clone();

        loop {
            if table.rid_locks[&rid].writer_txn_id == INVALID_TXN_ID {
                break;
            }
            if txn.state() == TransactionState::Aborted {
                Self::end_wait(&mut table, txn.id(), rid, &waited);
                return false;
            }
            cv.wait_for(&mut table, self.inner.interval);
        }

        table
            .rid_locks
            .get_mut(&rid)
            .expect("lock entry pinned by the request")
            .writer_txn_id = txn.id();

        loop {
            if table.rid_locks[&rid].reader_txn_ids.is_empty() {
                break;
            }
            if txn.state() == TransactionState::Aborted {
                Self::surrender_writer_claim(&mut table, txn.id(), rid);
                Self::end_wait(&mut table, txn.id(), rid, &waited);
                return false;
            }
            cv.wait_for(&mut table, self.inner.interval);
        }

        Self::end_wait(&mut table, txn.id(), rid, &waited);
        txn.add_exclusive_lock(rid);
        true
    }

    /// Upgrade a held shared lock to exclusive. The shared hold is released
    /// up front; on abort the transaction simply ends up without it.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let mut table = self.inner.table.lock();

        if !Self::admit(txn) {
            return false;
        }
        if txn.is_exclusive_locked(rid) {
            return true;
        }
        if !txn.is_shared_locked(rid) {
            debug!("txn {} upgrade without holding a shared lock", txn.id());
            return false;
        }

        txn.remove_shared_lock(rid);
        {
            let state = table.rid_locks.entry(rid).or_insert_with(RidLockState::new);
            state.reader_txn_ids.remove(&txn.id());
            if state.reader_txn_ids.is_empty() {
                // A competing exclusive request may be waiting on the readers.
                state.cv.notify_all();
            }
        }

        let mut waited = Vec::new();
        if table.rid_locks[&rid].writer_txn_id != INVALID_TXN_ID {
            waited.push(table.rid_locks[&rid].writer_txn_id);
        }
        Self::begin_wait(&mut table, txn, rid, LockMode::Exclusive, &waited);
        let cv = table.rid_locks[&rid].cv.clone();

        loop {
            if table.rid_locks[&rid].writer_txn_id == INVALID_TXN_ID {
                break;
            }
            if txn.state() == TransactionState::Aborted {
                Self::end_wait(&mut table, txn.id(), rid, &waited);
                return false;
            }
            cv.wait_for(&mut table, self.inner.interval);
        }

        // Claim the writer slot, then wait for the remaining readers.
        {
            let state = table
                .rid_locks
                .get_mut(&rid)
                .expect("lock entry pinned by the request");
            state.writer_txn_id = txn.id();
            for reader in state.reader_txn_ids.iter().copied().collect::<Vec<_>>() {
                waited.push(reader);
            }
        }
        for &reader in waited.iter() {
            if reader != txn.id() {
                table.waits_for.insert((txn.id(), reader));
            }
        }

        loop {
            if table.rid_locks[&rid].reader_txn_ids.is_empty() {
                break;
            }
            if txn.state() == TransactionState::Aborted {
                Self::surrender_writer_claim(&mut table, txn.id(), rid);
                Self::end_wait(&mut table, txn.id(), rid, &waited);
                return false;
            }
            cv.wait_for(&mut table, self.inner.interval);
        }

        Self::end_wait(&mut table, txn.id(), rid, &waited);
        txn.add_exclusive_lock(rid);
        true
    }

    /// Release a held lock. Unlocking something that is not held returns
    /// false and changes nothing.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let mut table = self.inner.table.lock();

        let (was_shared, was_exclusive) = txn.remove_lock(rid);
        if !was_shared && !was_exclusive {
            debug!("txn {} unlock of unheld lock on {:?}", txn.id(), rid);
            return false;
        }

        if txn.state() == TransactionState::Growing
            && txn.isolation_level() == IsolationLevel::RepeatableRead
        {
            txn.set_state(TransactionState::Shrinking);
        }

        if let Some(state) = table.rid_locks.get_mut(&rid) {
            if was_exclusive && state.writer_txn_id == txn.id() {
                state.writer_txn_id = INVALID_TXN_ID;
                state.cv.notify_all();
            } else if was_shared {
                state.reader_txn_ids.remove(&txn.id());
                if state.reader_txn_ids.is_empty() {
                    state.cv.notify_one();
                }
            }
            if state.is_free() {
                table.rid_locks.remove(&rid);
            }
        }

        true
    }

    // ---- wait bookkeeping ----

    /// Transition into Aborted on a 2PL violation; report whether the
    /// transaction may proceed at all.
    fn admit(txn: &Transaction) -> bool {
        if txn.state() == TransactionState::Shrinking
            && txn.isolation_level() == IsolationLevel::RepeatableRead
        {
            txn.set_state(TransactionState::Aborted);
        }
        txn.state() != TransactionState::Aborted
    }

    fn begin_wait(
        table: &mut LockTable,
        txn: &Arc<Transaction>,
        rid: Rid,
        mode: LockMode,
        waited: &[TxnId],
    ) {
        for &holder in waited {
            table.waits_for.insert((txn.id(), holder));
        }
        table
            .rid_locks
            .get_mut(&rid)
            .expect("lock entry pinned by the request")
            .request_queue
            .push_back(LockRequest {
                txn_id: txn.id(),
                mode,
            });
        table.waiters.insert(txn.id(), txn.clone());
    }

    /// Undo every trace of a wait: edges, queue entry, waiter registration.
    /// Used both on success and on abort.
    fn end_wait(table: &mut LockTable, txn_id: TxnId, rid: Rid, waited: &[TxnId]) {
        for &holder in waited {
            table.waits_for.remove(&(txn_id, holder));
        }
        if let Some(state) = table.rid_locks.get_mut(&rid) {
            state.request_queue.retain(|request| request.txn_id != txn_id);
            if state.is_free() {
                table.rid_locks.remove(&rid);
            }
        }
        table.waiters.remove(&txn_id);
    }

    /// An aborted request that had already claimed the writer slot must put
    /// it back and wake everyone, or the table wedges.
    fn surrender_writer_claim(table: &mut LockTable, txn_id: TxnId, rid: Rid) {
        if let Some(state) = table.rid_locks.get_mut(&rid) {
            if state.writer_txn_id == txn_id {
                state.writer_txn_id = INVALID_TXN_ID;
                state.cv.notify_all();
            }
        }
    }

    // ---- deadlock detection ----

    /// White-box graph access used by tests.
    pub fn add_edge(&self, waiter: TxnId, holder: TxnId) {
        self.inner.table.lock().waits_for.insert((waiter, holder));
    }

    pub fn remove_edge(&self, waiter: TxnId, holder: TxnId) {
        self.inner.table.lock().waits_for.remove(&(waiter, holder));
    }

    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        self.inner.table.lock().waits_for.iter().copied().collect()
    }

    /// Run one detection pass without aborting anyone; returns the victim
    /// the detector would pick (the highest txn id on the cycle found).
    pub fn detect_victim(&self) -> Option<TxnId> {
        let table = self.inner.table.lock();
        Self::find_cycle_victim(&table)
    }

    fn run_cycle_detection(inner: Arc<LockManagerInner>) {
        loop {
            {
                let mut guard = inner.shutdown.lock();
                inner.shutdown_cv.wait_for(&mut guard, inner.interval);
            }
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }

            let mut guard = inner.table.lock();
            let table = &mut *guard;
            if let Some(victim) = Self::find_cycle_victim(table) {
                if let Some(txn) = table.waiters.get(&victim) {
                    info!("deadlock detected, aborting txn {}", victim);
                    txn.set_state(TransactionState::Aborted);
                }
                // One abort per round; wake every blocked request so the
                // victim observes its state promptly.
                for state in table.rid_locks.values() {
                    state.cv.notify_all();
                }
            }
        }
    }

    /// DFS over the wait-for graph with sorted vertices and neighbors; the
    /// first cycle found nominates its highest (youngest) txn id.
    ///
    /// Vertex states are the usual three colors: 0 = unvisited, 1 = on the
    /// current recursion stack, 2 = fully explored. Only an edge back to a
    /// stack vertex closes a cycle; an edge into an explored vertex is a
    /// cross edge and must not pick a victim (two waiters converging on one
    /// holder is a DAG, not a deadlock).
    fn find_cycle_victim(table: &LockTable) -> Option<TxnId> {
        let mut adjacency: BTreeMap<TxnId, Vec<TxnId>> = BTreeMap::new();
        let mut vertices: BTreeSet<TxnId> = BTreeSet::new();
        for &(waiter, holder) in &table.waits_for {
            adjacency.entry(waiter).or_default().push(holder);
            vertices.insert(waiter);
            vertices.insert(holder);
        }
        for neighbors in adjacency.values_mut() {
            neighbors.sort_unstable();
        }

        let mut states: HashMap<TxnId, u8> = HashMap::new();
        for &vertex in &vertices {
            if states.get(&vertex).copied().unwrap_or(0) == 0 {
                let mut cycle_start = INVALID_TXN_ID;
                let mut victim = None;
                Self::dfs(&adjacency, &mut states, &mut cycle_start, &mut victim, vertex);
                if victim.is_some() {
                    return victim;
                }
            }
        }
        None
    }

    fn dfs(
        adjacency: &BTreeMap<TxnId, Vec<TxnId>>,
        states: &mut HashMap<TxnId, u8>,
        cycle_start: &mut TxnId,
        victim: &mut Option<TxnId>,
        vertex: TxnId,
    ) -> bool {
        states.insert(vertex, 1);
        if let Some(neighbors) = adjacency.get(&vertex) {
            for &next in neighbors {
                match states.get(&next).copied().unwrap_or(0) {
                    1 => {
                        // Back edge to a stack vertex: the cycle closes at
                        // `next`.
                        *cycle_start = next;
                        *victim = Some(victim.map_or(vertex, |v| v.max(vertex)));
                        return true;
                    }
                    2 => {
                        // Cross edge into an already-explored subgraph.
                        continue;
                    }
                    _ => {
                        if Self::dfs(adjacency, states, cycle_start, victim, next) {
                            *victim = Some(victim.map_or(vertex, |v| v.max(vertex)));
                            return vertex != *cycle_start;
                        }
                    }
                }
            }
        }
        states.insert(vertex, 2);
        false
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown_cv.notify_all();
        if let Some(handle) = self.detector.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_detection_picks_youngest() {
        let lock_manager = LockManager::with_config(LockManagerConfig {
            cycle_detection_interval: Duration::from_secs(3600),
        });

        lock_manager.add_edge(1, 2);
        lock_manager.add_edge(2, 1);
        assert_eq!(lock_manager.detect_victim(), Some(2));

        lock_manager.remove_edge(2, 1);
        assert_eq!(lock_manager.detect_victim(), None);
    }

    #[test]
    fn test_cycle_detection_three_party() {
        let lock_manager = LockManager::with_config(LockManagerConfig {
            cycle_detection_interval: Duration::from_secs(3600),
        });

        lock_manager.add_edge(1, 2);
        lock_manager.add_edge(2, 3);
        lock_manager.add_edge(3, 1);
        // Chain hanging off the cycle must not become the victim.
        lock_manager.add_edge(5, 1);

        assert_eq!(lock_manager.detect_victim(), Some(3));
    }

    #[test]
    fn test_converging_waits_are_not_a_cycle() {
        let lock_manager = LockManager::with_config(LockManagerConfig {
            cycle_detection_interval: Duration::from_secs(3600),
        });

        // txn 1 waits on txns 2 and 3, which each wait on txn 4. The waits
        // form a diamond that converges on 4 without any cycle; this is
        // exactly what an exclusive request produces against a writer plus
        // readers that are themselves blocked elsewhere.
        lock_manager.add_edge(1, 2);
        lock_manager.add_edge(1, 3);
        lock_manager.add_edge(2, 4);
        lock_manager.add_edge(3, 4);

        assert_eq!(lock_manager.detect_victim(), None);

        // Closing the diamond into a real cycle is still caught.
        lock_manager.add_edge(4, 1);
        assert_eq!(lock_manager.detect_victim(), Some(4));
    }

    #[test]
    fn test_edge_list_is_sorted_and_deduplicated() {
        let lock_manager = LockManager::with_config(LockManagerConfig {
            cycle_detection_interval: Duration::from_secs(3600),
        });

        lock_manager.add_edge(4, 2);
        lock_manager.add_edge(1, 3);
        lock_manager.add_edge(4, 2);

        assert_eq!(lock_manager.edge_list(), vec![(1, 3), (4, 2)]);
    }
}
