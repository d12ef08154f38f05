use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// The header page is pre-allocated at database creation and stores one
/// (index_name, root_page_id) record per index.
pub const HEADER_PAGE_ID: PageId = 0;

/// Buffer pool frame ID type; indexes the frame vector
pub type FrameId = usize;

/// Transaction ID type
pub type TxnId = u32;

/// Sentinel for "no transaction"
pub const INVALID_TXN_ID: TxnId = TxnId::MAX;

/// Record ID - names one tuple as (page, slot); the lock granule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

/// Page structure. The surrounding `RwLock` in `PagePtr` is the page latch:
/// callers holding at least a read guard may read `data`, only a write guard
/// may mutate it. Pin counts and dirty flags are frame metadata owned by the
/// buffer pool, not by the page.
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Zero the buffer and drop the identity, returning the frame to a blank state.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
    }
}

/// Smart pointer to a latched page
pub type PagePtr = Arc<RwLock<Page>>;
