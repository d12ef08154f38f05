use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::common::types::{PageId, Rid, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// 2PL transaction states: a transaction first only acquires locks
/// (Growing), then only releases them (Shrinking), and ends Committed or
/// Aborted. There is no way back from Shrinking to Growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    Growing = 0,
    Shrinking = 1,
    Committed = 2,
    Aborted = 3,
}

impl TransactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Growing,
            1 => TransactionState::Shrinking,
            2 => TransactionState::Committed,
            _ => TransactionState::Aborted,
        }
    }
}

/// Kind of write captured in the transaction's write record log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

/// One logical write performed by the transaction, kept so executors can
/// walk their effects at abort.
#[derive(Debug, Clone, Copy)]
pub struct WriteRecord {
    pub rid: Rid,
    pub op: WriteOp,
}

/// An active transaction, shared across threads as `Arc<Transaction>`.
///
/// The state is atomic because the deadlock detector flips it to Aborted
/// from its own thread; the lock sets and deferred deleted pages sit behind
/// small mutexes of their own.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: AtomicU8,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    deleted_page_set: Mutex<HashSet<PageId>>,
    write_set: Mutex<Vec<WriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: AtomicU8::new(TransactionState::Growing as u8),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            deleted_page_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    // ---- lock bookkeeping (driven by the lock manager) ----

    pub fn is_shared_locked(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn is_exclusive_locked(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub fn remove_shared_lock(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().remove(&rid)
    }

    /// Drop the lock from both sets. Returns (was_shared, was_exclusive).
    pub fn remove_lock(&self, rid: Rid) -> (bool, bool) {
        let was_shared = self.shared_lock_set.lock().remove(&rid);
        let was_exclusive = self.exclusive_lock_set.lock().remove(&rid);
        (was_shared, was_exclusive)
    }

    /// Every RID this transaction currently holds in either mode.
    pub fn held_locks(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    // ---- deferred page deletion ----

    pub fn add_deleted_page(&self, page_id: PageId) {
        self.deleted_page_set.lock().insert(page_id);
    }

    /// Drain the deferred deletions; called once all latches of the current
    /// operation are released, and again (usually finding nothing) at
    /// commit/abort.
    pub fn take_deleted_pages(&self) -> Vec<PageId> {
        self.deleted_page_set.lock().drain().collect()
    }

    // ---- write record log ----

    pub fn append_write_record(&self, record: WriteRecord) {
        self.write_set.lock().push(record);
    }

    pub fn take_write_records(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut *self.write_set.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_lock_set_bookkeeping() {
        let txn = Transaction::new(2, IsolationLevel::ReadCommitted);
        let rid_a = Rid::new(1, 0);
        let rid_b = Rid::new(1, 1);

        txn.add_shared_lock(rid_a);
        txn.add_exclusive_lock(rid_b);
        assert!(txn.is_shared_locked(rid_a));
        assert!(txn.is_exclusive_locked(rid_b));
        assert_eq!(txn.held_locks().len(), 2);

        assert_eq!(txn.remove_lock(rid_a), (true, false));
        assert_eq!(txn.remove_lock(rid_a), (false, false));
        assert_eq!(txn.remove_lock(rid_b), (false, true));
        assert!(txn.held_locks().is_empty());
    }

    #[test]
    fn test_deleted_pages_drain() {
        let txn = Transaction::new(3, IsolationLevel::RepeatableRead);
        txn.add_deleted_page(7);
        txn.add_deleted_page(9);
        txn.add_deleted_page(7);

        let mut drained = txn.take_deleted_pages();
        drained.sort_unstable();
        assert_eq!(drained, vec![7, 9]);
        assert!(txn.take_deleted_pages().is_empty());
    }

    #[test]
    fn test_state_transitions_are_visible() {
        let txn = Transaction::new(4, IsolationLevel::RepeatableRead);
        txn.set_state(TransactionState::Shrinking);
        assert_eq!(txn.state(), TransactionState::Shrinking);
        txn.set_state(TransactionState::Aborted);
        assert_eq!(txn.state(), TransactionState::Aborted);
    }
}
