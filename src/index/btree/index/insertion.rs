use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{INVALID_PAGE_ID, PageId};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{deserialize_node, serialize_node};

use super::base::{BPlusTree, PageReadGuard, RootWriteGuard, WritePathEntry};

/// Outcome of the optimistic phase.
enum OptimisticInsert {
    Inserted,
    Duplicate,
    /// The leaf (or the tree shape) cannot absorb the insert in place;
    /// retry with full write-latch crabbing.
    MustRestructure,
}

impl<K, V> BPlusTree<K, V>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Insert a key-value pair. Returns false on a duplicate key.
    pub fn insert(&self, key: K, value: V) -> Result<bool, BTreeError> {
        match self.insert_optimistic(&key, &value)? {
            OptimisticInsert::Inserted => Ok(true),
            OptimisticInsert::Duplicate => Ok(false),
            OptimisticInsert::MustRestructure => self.insert_pessimistic(key, value),
        }
    }

    /// Phase A: descend with read latches, write-latch only the target leaf.
    ///
    /// The immediate parent's read latch (or the root latch, when the root is
    /// the leaf) stays held across the leaf's read-to-write latch upgrade, so
    /// no structural change can slip in between; only in-place leaf updates
    /// from other optimistic operations can, and those never move the key
    /// range. The leaf's safety is rechecked under the write latch.
    fn insert_optimistic(&self, key: &K, value: &V) -> Result<OptimisticInsert, BTreeError> {
        let root_guard = self.root.read_arc();
        if *root_guard == INVALID_PAGE_ID {
            // An empty tree needs a root id update; only Phase B may do that.
            return Ok(OptimisticInsert::MustRestructure);
        }

        let mut dummy = Some(root_guard);
        let mut read_path: VecDeque<PageReadGuard> = VecDeque::new();

        let root_id = **dummy.as_ref().expect("root guard held");
        let mut current_page = self.buffer_pool.fetch_page(root_id)?;
        let mut current_guard = current_page.read_arc();
        let mut current_node: BTreeNode<K, V> = deserialize_node(&current_guard)?;

        loop {
            if current_node.is_leaf() {
                let leaf_id = current_guard.page_id;
                drop(current_guard);
                let mut leaf_guard = current_page.write_arc();
                let mut leaf_node: BTreeNode<K, V> = deserialize_node(&leaf_guard)?;

                if !leaf_node.is_leaf() || !leaf_node.is_safe_for_insert() {
                    drop(leaf_guard);
                    self.buffer_pool.unpin_page(leaf_id, false);
                    self.release_read_path(&mut read_path);
                    drop(dummy);
                    return Ok(OptimisticInsert::MustRestructure);
                }

                let inserted = leaf_node.leaf_insert(key.clone(), value.clone());
                if inserted {
                    serialize_node(&leaf_node, &mut leaf_guard)?;
                }
                drop(leaf_guard);
                self.buffer_pool.unpin_page(leaf_id, inserted);
                self.release_read_path(&mut read_path);
                drop(dummy);

                return Ok(if inserted {
                    OptimisticInsert::Inserted
                } else {
                    OptimisticInsert::Duplicate
                });
            }

            // Internal node: once it is proven safe, everything above it can
            // be released.
            if current_node.is_safe_for_insert() {
                dummy = None;
                self.release_read_path(&mut read_path);
            }

            let child_id = current_node.child_lookup(key);
            let child_page = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_page.read_arc();

            read_path.push_back(current_guard);
            current_page = child_page;
            current_guard = child_guard;
            current_node = deserialize_node(&current_guard)?;
        }
    }

    /// Phase B: write-latch crabbing from the root latch down. Ancestors are
    /// released as soon as a child is proven safe; whatever remains latched
    /// is exactly the path a split may touch.
    fn insert_pessimistic(&self, key: K, value: V) -> Result<bool, BTreeError> {
        let mut root_guard: Option<RootWriteGuard> = Some(self.root.write_arc());

        if **root_guard.as_ref().expect("root guard held") == INVALID_PAGE_ID {
            return self.start_new_tree(key, value, root_guard.take().expect("root guard held"));
        }

        let mut path: Vec<WritePathEntry<K, V>> = Vec::new();
        let mut page_id = **root_guard.as_ref().expect("root guard held");

        loop {
            let page = self.buffer_pool.fetch_page(page_id)?;
            let guard = page.write_arc();
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;

            if node.is_safe_for_insert() {
                root_guard = None;
                self.release_write_path(&mut path);
            }

            let is_leaf = node.is_leaf();
            let next_page_id = if is_leaf { None } else { Some(node.child_lookup(&key)) };
            path.push(WritePathEntry {
                guard,
                node,
                dirty: false,
                dropped: false,
            });

            match next_page_id {
                Some(child_id) => page_id = child_id,
                None => break,
            }
        }

        let leaf = path.last_mut().expect("descent reached a leaf");
        let inserted = leaf.node.leaf_insert(key, value);
        leaf.dirty = inserted;

        if inserted && leaf.node.is_overfull() {
            self.split_up(&mut path, &mut root_guard)?;
        }

        self.flush_write_path(&mut path)?;
        drop(root_guard);
        Ok(inserted)
    }

    /// First insert into an empty tree: allocate a leaf root and persist the
    /// new root id, all under the root write latch.
    fn start_new_tree(
        &self,
        key: K,
        value: V,
        mut root_guard: RootWriteGuard,
    ) -> Result<bool, BTreeError> {
        let (page, page_id) = self.buffer_pool.new_page()?;
        {
            let mut guard = page.write();
            let mut node: BTreeNode<K, V> = BTreeNode::new_leaf(self.leaf_max_size, INVALID_PAGE_ID);
            node.leaf_insert(key, value);
            serialize_node(&node, &mut guard)?;
        }
        self.buffer_pool.unpin_page(page_id, true);

        *root_guard = page_id;
        self.update_root_record(page_id)?;
        Ok(true)
    }

    /// Split overfull nodes bottom-up along the latched path. Each level
    /// allocates its new page before mutating anything, so an exhausted pool
    /// leaves the tree structurally valid.
    fn split_up(
        &self,
        path: &mut Vec<WritePathEntry<K, V>>,
        root_guard: &mut Option<RootWriteGuard>,
    ) -> Result<(), BTreeError> {
        let mut level = path.len() - 1;

        loop {
            if !path[level].node.is_overfull() {
                break;
            }

            let splitting_root = level == 0;

            // Allocate every page this level needs before mutating anything,
            // so an exhausted pool leaves the tree intact.
            let (new_page, new_page_id) = self.buffer_pool.new_page()?;
            let mut new_guard = new_page.write_arc();
            let root_alloc = if splitting_root {
                match self.buffer_pool.new_page() {
                    Ok(alloc) => Some(alloc),
                    Err(e) => {
                        drop(new_guard);
                        self.buffer_pool.unpin_page(new_page_id, false);
                        let _ = self.buffer_pool.delete_page(new_page_id);
                        return Err(e.into());
                    }
                }
            } else {
                None
            };

            let old_page_id = path[level].guard.page_id;
            let (separator, mut new_node) = if path[level].node.is_leaf() {
                path[level].node.split_leaf(new_page_id)
            } else {
                path[level].node.split_internal()
            };
            path[level].dirty = true;

            if !new_node.is_leaf() {
                let moved: Vec<PageId> = new_node.children.clone();
                for child_id in moved {
                    self.reparent_child(path, child_id, new_page_id)?;
                }
            }

            if let Some((root_page, new_root_id)) = root_alloc {
                // Splitting the true root: the root latch is necessarily
                // still held, since an unsafe root is never released.
                let mut root_page_guard = root_page.write_arc();

                let mut new_root: BTreeNode<K, V> =
                    BTreeNode::new_internal(self.internal_max_size, INVALID_PAGE_ID);
                new_root.populate_new_root(old_page_id, separator, new_page_id);
                serialize_node(&new_root, &mut root_page_guard)?;
                drop(root_page_guard);
                self.buffer_pool.unpin_page(new_root_id, true);

                path[level].node.parent_page_id = new_root_id;
                new_node.parent_page_id = new_root_id;
                serialize_node(&new_node, &mut new_guard)?;
                drop(new_guard);
                self.buffer_pool.unpin_page(new_page_id, true);

                let guard = root_guard
                    .as_mut()
                    .expect("root latch must be held for a root split");
                **guard = new_root_id;
                self.update_root_record(new_root_id)?;
                break;
            }

            let parent_page_id: PageId = path[level - 1].guard.page_id;
            new_node.parent_page_id = parent_page_id;
            serialize_node(&new_node, &mut new_guard)?;
            drop(new_guard);
            self.buffer_pool.unpin_page(new_page_id, true);

            path[level - 1]
                .node
                .insert_child_after(old_page_id, separator, new_page_id);
            path[level - 1].dirty = true;
            level -= 1;
        }

        Ok(())
    }
}
