pub mod concurrency;

pub use concurrency::{
    IsolationLevel, LockManager, LockManagerConfig, Transaction, TransactionManager,
    TransactionState,
};
