use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::PageManager;

/// Owned page-latch guards: they keep the page's Arc alive, so they can sit
/// in a crabbing deque independent of any borrow.
pub(crate) type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub(crate) type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Guards over the root page id. This is the latch above the tree root in
/// the latch hierarchy: any operation that might change root_page_id holds
/// it in write mode, readers crab through it in read mode.
pub(crate) type RootReadGuard = ArcRwLockReadGuard<RawRwLock, PageId>;
pub(crate) type RootWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageId>;

/// One write-latched step of a root-to-leaf descent.
pub(crate) struct WritePathEntry<K, V> {
    pub guard: PageWriteGuard,
    pub node: BTreeNode<K, V>,
    pub dirty: bool,
    /// Merged-away nodes are not written back; their page goes to the
    /// transaction's deleted-page set instead.
    pub dropped: bool,
}

/// Concurrent B+Tree index backed by buffer pool pages.
///
/// Keys and values are fixed at the type level; the tree stores unique keys
/// in sorted leaf order with a singly-linked leaf chain for range scans.
pub struct BPlusTree<K, V> {
    index_name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) page_manager: PageManager,
    pub(crate) root: Arc<RwLock<PageId>>,
    /// Slot of this index's record in the header page
    header_slot: u32,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    _phantom: PhantomData<(K, V)>,
}

impl<K, V> BPlusTree<K, V>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open the named index, creating its header record if this is the first
    /// time the name is seen. An existing record restores the persisted
    /// root_page_id, so a reopened tree finds its pages again.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        let index_name = index_name.into();
        let page_manager = PageManager::new();

        let header_page = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let mut root_page_id = INVALID_PAGE_ID;
        let mut header_slot = None;
        let mut header_dirty;
        {
            let mut page = header_page.write();
            header_dirty = page_manager.init_page_if_needed(&mut page);

            for slot in 0..page_manager.record_count(&page) {
                let bytes = page_manager.get_record(&page, slot)?;
                let (name, root): (String, PageId) = bincode::deserialize(&bytes)
                    .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
                if name == index_name {
                    root_page_id = root;
                    header_slot = Some(slot);
                    break;
                }
            }

            if header_slot.is_none() {
                let record = bincode::serialize(&(index_name.clone(), root_page_id))
                    .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
                header_slot = Some(page_manager.insert_record(&mut page, &record)?);
                header_dirty = true;
            }
        }
        buffer_pool.unpin_page(HEADER_PAGE_ID, header_dirty);

        Ok(Self {
            index_name,
            buffer_pool,
            page_manager,
            root: Arc::new(RwLock::new(root_page_id)),
            header_slot: header_slot.expect("header slot resolved above"),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root.read()
    }

    /// Point query. Crabs reader latches top-down: the child latch is taken
    /// before the parent latch is released.
    pub fn get_value(&self, key: &K) -> Result<Option<V>, BTreeError> {
        let root_guard: RootReadGuard = self.root.read_arc();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(None);
        }

        let page = self.buffer_pool.fetch_page(*root_guard)?;
        let mut guard: PageReadGuard = page.read_arc();
        drop(root_guard);

        loop {
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;
            if node.is_leaf() {
                let result = node.leaf_lookup(key).cloned();
                let page_id = guard.page_id;
                drop(guard);
                self.buffer_pool.unpin_page(page_id, false);
                return Ok(result);
            }

            let child_id = node.child_lookup(key);
            let child_page = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_page.read_arc();

            let parent_id = guard.page_id;
            drop(guard);
            self.buffer_pool.unpin_page(parent_id, false);
            guard = child_guard;
        }
    }

    /// Persist the root page id into this index's header-page record.
    /// Callers hold the root latch in write mode; the header page latch is
    /// only taken transiently here, below every tree latch.
    pub(crate) fn update_root_record(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let record = bincode::serialize(&(self.index_name.clone(), root_page_id))
            .map_err(|e| BTreeError::SerializationError(e.to_string()))?;

        let header_page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page = header_page.write();
            self.page_manager
                .update_record(&mut page, self.header_slot, &record)?;
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }

    /// Drop every reader guard front-to-back, unpinning after each latch
    /// release. Latches are always released before the unpin so the buffer
    /// pool never contends with a latch we still hold.
    pub(crate) fn release_read_path(&self, path: &mut VecDeque<PageReadGuard>) {
        while let Some(guard) = path.pop_front() {
            let page_id = guard.page_id;
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false);
        }
    }

    /// Drop write-latched ancestors accumulated during a pessimistic
    /// descent. Only used before any mutation happened, so nothing is
    /// written back.
    pub(crate) fn release_write_path(&self, path: &mut Vec<WritePathEntry<K, V>>) {
        for entry in path.drain(..) {
            debug_assert!(!entry.dirty && !entry.dropped);
            let page_id = entry.guard.page_id;
            drop(entry.guard);
            self.buffer_pool.unpin_page(page_id, false);
        }
    }

    /// Serialize every surviving dirty node back into its page, then release
    /// latches and pins top-down.
    pub(crate) fn flush_write_path(
        &self,
        path: &mut Vec<WritePathEntry<K, V>>,
    ) -> Result<(), BTreeError> {
        for mut entry in path.drain(..) {
            if entry.dirty && !entry.dropped {
                serialize_node(&entry.node, &mut entry.guard)?;
            }
            let page_id = entry.guard.page_id;
            let dirty = entry.dirty && !entry.dropped;
            drop(entry.guard);
            self.buffer_pool.unpin_page(page_id, dirty);
        }
        Ok(())
    }

    /// Rewrite the parent pointer of a child moved by a split or merge.
    ///
    /// The child may be one of this operation's own write-latched path
    /// entries (the descent continued into it); the page cannot be latched a
    /// second time, and the in-memory node is what gets flushed, so such
    /// children are updated in place. A dropped entry's page is about to be
    /// deleted and needs no update at all.
    pub(crate) fn reparent_child(
        &self,
        path: &mut [WritePathEntry<K, V>],
        child_id: PageId,
        parent_page_id: PageId,
    ) -> Result<(), BTreeError> {
        for entry in path.iter_mut() {
            if entry.guard.page_id == child_id {
                if !entry.dropped {
                    entry.node.parent_page_id = parent_page_id;
                    entry.dirty = true;
                }
                return Ok(());
            }
        }
        self.set_parent(child_id, parent_page_id)
    }

    /// Rewrite a node's parent pointer through the buffer pool. Only valid
    /// for pages this operation holds no latch on.
    pub(crate) fn set_parent(
        &self,
        page_id: PageId,
        parent_page_id: PageId,
    ) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        {
            let mut guard = page.write();
            let mut node: BTreeNode<K, V> = deserialize_node(&guard)?;
            node.parent_page_id = parent_page_id;
            serialize_node(&node, &mut guard)?;
        }
        self.buffer_pool.unpin_page(page_id, true);
        Ok(())
    }
}
