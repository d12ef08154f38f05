// Export public modules
pub mod common;
pub mod execution;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use index::btree::{BPlusTree, BTreeError};
pub use storage::buffer::{BufferPoolError, BufferPoolManager};
pub use storage::disk::DiskManager;
pub use storage::page::PageManager;
pub use transaction::concurrency::{
    IsolationLevel, LockManager, LockManagerConfig, Transaction, TransactionManager,
    TransactionState,
};
