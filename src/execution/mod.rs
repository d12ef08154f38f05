// Executor contract exposed by the storage kernel.
//
// Concrete executors (scans, joins, aggregations) live with the query layer;
// the kernel only fixes the iterator interface they implement and the error
// channel through which aborts surface.

use thiserror::Error;

use crate::common::types::Rid;
use crate::index::btree::BTreeError;
use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Transaction aborted")]
    TransactionAborted,

    #[error("Index error: {0}")]
    IndexError(#[from] BTreeError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Volcano-style executor: `init` once, then `next` until it yields `None`.
/// Each call is synchronous; a deadlock abort surfaces as
/// `ExecutionError::TransactionAborted` and the caller aborts the
/// transaction.
pub trait Executor {
    type Tuple;

    fn init(&mut self) -> ExecutionResult<()>;

    fn next(&mut self) -> ExecutionResult<Option<(Self::Tuple, Rid)>>;
}
