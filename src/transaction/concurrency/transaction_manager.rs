use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::TxnId;
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} not found")]
    NotFound(TxnId),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),
}

/// Transaction coordinator - creates and tracks transactions, and tears
/// down their side effects at commit/abort: every held lock is released
/// through the lock manager and every deferred page deletion is returned to
/// the buffer pool.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    buffer_pool: Arc<BufferPoolManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            buffer_pool,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction at the given isolation level.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, txn.clone());
        txn
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    /// Commit: mark committed, release all locks, return deferred pages.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        txn.set_state(TransactionState::Committed);
        self.finalize(txn)
    }

    /// Abort: mark aborted, release all locks, return deferred pages. The
    /// write-record log is handed back for executors to undo; recovery
    /// proper is out of scope here.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        txn.set_state(TransactionState::Aborted);
        txn.take_write_records();
        self.finalize(txn)
    }

    fn finalize(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        for rid in txn.held_locks() {
            self.lock_manager.unlock(txn, rid);
        }
        for page_id in txn.take_deleted_pages() {
            self.buffer_pool.delete_page(page_id)?;
        }
        self.active_transactions.lock().remove(&txn.id());
        Ok(())
    }
}
