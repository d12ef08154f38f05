pub mod lock_manager;
pub mod transaction;
pub mod transaction_manager;

pub use lock_manager::{LockManager, LockManagerConfig, LockMode};
pub use transaction::{IsolationLevel, Transaction, TransactionState, WriteOp, WriteRecord};
pub use transaction_manager::{TransactionError, TransactionManager};
