use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use crate::transaction::concurrency::transaction::Transaction;

use super::base::{BPlusTree, PageReadGuard, RootWriteGuard, WritePathEntry};

enum OptimisticRemove {
    Done,
    MustRestructure,
}

impl<K, V> BPlusTree<K, V>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Remove a key; absent keys are a no-op. Pages emptied by merges are
    /// deferred into the transaction's deleted-page set and returned to the
    /// buffer pool only after every latch of this operation is released.
    pub fn remove(&self, key: &K, txn: &Transaction) -> Result<(), BTreeError> {
        match self.remove_optimistic(key)? {
            OptimisticRemove::Done => Ok(()),
            OptimisticRemove::MustRestructure => {
                self.remove_pessimistic(key, txn)?;
                for page_id in txn.take_deleted_pages() {
                    self.buffer_pool.delete_page(page_id)?;
                }
                Ok(())
            }
        }
    }

    /// Phase A: read-latch the ancestor path, write-latch the target leaf
    /// alone. Falls back when the leaf could underflow.
    fn remove_optimistic(&self, key: &K) -> Result<OptimisticRemove, BTreeError> {
        let root_guard = self.root.read_arc();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(OptimisticRemove::Done);
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

                if !leaf_node.is_leaf() || !leaf_node.is_safe_for_delete() {
                    drop(leaf_guard);
                    self.buffer_pool.unpin_page(leaf_id, false);
                    self.release_read_path(&mut read_path);
                    drop(dummy);
                    return Ok(OptimisticRemove::MustRestructure);
                }

                let removed = leaf_node.leaf_remove(key);
                if removed {
                    serialize_node(&leaf_node, &mut leaf_guard)?;
                }
                drop(leaf_guard);
                self.buffer_pool.unpin_page(leaf_id, removed);
                self.release_read_path(&mut read_path);
                drop(dummy);
                return Ok(OptimisticRemove::Done);
            }

            if current_node.is_safe_for_delete() {
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

    /// Phase B: write-latch crabbing; ancestors are released once a child
    /// cannot underflow. An underflowing leaf triggers merge or
    /// redistribution along the still-latched path.
    fn remove_pessimistic(&self, key: &K, txn: &Transaction) -> Result<(), BTreeError> {
        let mut root_guard: Option<RootWriteGuard> = Some(self.root.write_arc());
        if **root_guard.as_ref().expect("root guard held") == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut path: Vec<WritePathEntry<K, V>> = Vec::new();
        let mut page_id = **root_guard.as_ref().expect("root guard held");

        loop {
            let page = self.buffer_pool.fetch_page(page_id)?;
            let guard = page.write_arc();
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;

            if node.is_safe_for_delete() {
                root_guard = None;
                self.release_write_path(&mut path);
            }

            let is_leaf = node.is_leaf();
            let next_page_id = if is_leaf { None } else { Some(node.child_lookup(key)) };
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
        let removed = leaf.node.leaf_remove(key);
        leaf.dirty = removed;

        if removed && leaf.node.is_underfull() {
            self.coalesce_or_redistribute(&mut path, &mut root_guard, txn)?;
        }

        self.flush_write_path(&mut path)?;
        drop(root_guard);
        Ok(())
    }

    /// Repair underflow bottom-up along the latched path. The sibling is
    /// taken from the same parent, preferring the left one; siblings fit in
    /// one node they are merged, otherwise a single entry is redistributed
    /// and the parent separator rewritten.
    fn coalesce_or_redistribute(
        &self,
        path: &mut Vec<WritePathEntry<K, V>>,
        root_guard: &mut Option<RootWriteGuard>,
        txn: &Transaction,
    ) -> Result<(), BTreeError> {
        let mut level = path.len() - 1;

        loop {
            if !path[level].node.is_underfull() {
                break;
            }
            if level == 0 {
                // Underfull at the top of the latched path means the true
                // root (an unsafe root is never released during descent).
                self.adjust_root(path, root_guard, txn)?;
                break;
            }

            let node_page_id = path[level].guard.page_id;

            // Children moved between nodes need their parent pointers
            // rewritten, but one of them may be our own latched descent
            // child; collect the moves here and route them through
            // reparent_child once the split borrow of the path ends.
            let mut reparent: Vec<(PageId, PageId)> = Vec::new();
            let merged;
            {
                let (upper, lower) = path.split_at_mut(level);
                let parent = &mut upper[level - 1];
                let entry = &mut lower[0];
                let node_index = parent
                    .node
                    .child_index(node_page_id)
                    .expect("underfull node must be under its latched parent");

                let node_is_leaf = entry.node.is_leaf();
                let max_combined = if node_is_leaf {
                    entry.node.max_size - 1
                } else {
                    entry.node.max_size
                };

                if node_index > 0 {
                    // Left sibling preferred.
                    let sibling_id = parent.node.child_at(node_index - 1);
                    let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
                    let mut sibling_guard = sibling_page.write_arc();
                    let mut sibling: BTreeNode<K, V> = deserialize_node(&sibling_guard)?;

                    if sibling.size() + entry.node.size() <= max_combined {
                        // Merge this node into its left sibling and drop it.
                        let node = std::mem::replace(
                            &mut entry.node,
                            BTreeNode::new_leaf(0, INVALID_PAGE_ID),
                        );
                        if node_is_leaf {
                            sibling.merge_leaf(node);
                        } else {
                            let separator = parent.node.separator_at(node_index).clone();
                            for &child_id in &node.children {
                                reparent.push((child_id, sibling_id));
                            }
                            sibling.merge_internal(separator, node);
                        }
                        serialize_node(&sibling, &mut sibling_guard)?;
                        drop(sibling_guard);
                        self.buffer_pool.unpin_page(sibling_id, true);

                        entry.dropped = true;
                        txn.add_deleted_page(node_page_id);
                        parent.node.remove_child_at(node_index);
                        parent.dirty = true;
                        merged = true;
                    } else {
                        // Redistribute: steal the left sibling's last entry.
                        let new_separator = if node_is_leaf {
                            entry.node.leaf_borrow_from_left(&mut sibling)
                        } else {
                            let separator = parent.node.separator_at(node_index).clone();
                            let new_separator =
                                entry.node.internal_borrow_from_left(&mut sibling, separator);
                            reparent.push((entry.node.child_at(0), node_page_id));
                            new_separator
                        };
                        serialize_node(&sibling, &mut sibling_guard)?;
                        drop(sibling_guard);
                        self.buffer_pool.unpin_page(sibling_id, true);

                        parent.node.set_separator_at(node_index, new_separator);
                        parent.dirty = true;
                        entry.dirty = true;
                        merged = false;
                    }
                } else {
                    // Leftmost child: fall back to the right sibling.
                    let sibling_index = node_index + 1;
                    let sibling_id = parent.node.child_at(sibling_index);
                    let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
                    let mut sibling_guard = sibling_page.write_arc();
                    let mut sibling: BTreeNode<K, V> = deserialize_node(&sibling_guard)?;

                    if sibling.size() + entry.node.size() <= max_combined {
                        // Merge the right sibling into this node and drop the
                        // sibling.
                        if node_is_leaf {
                            entry.node.merge_leaf(sibling);
                        } else {
                            let separator = parent.node.separator_at(sibling_index).clone();
                            for &child_id in &sibling.children {
                                reparent.push((child_id, node_page_id));
                            }
                            entry.node.merge_internal(separator, sibling);
                        }
                        drop(sibling_guard);
                        self.buffer_pool.unpin_page(sibling_id, false);

                        txn.add_deleted_page(sibling_id);
                        entry.dirty = true;
                        parent.node.remove_child_at(sibling_index);
                        parent.dirty = true;
                        merged = true;
                    } else {
                        // Redistribute: steal the right sibling's first entry.
                        let new_separator = if node_is_leaf {
                            entry.node.leaf_borrow_from_right(&mut sibling)
                        } else {
                            let separator = parent.node.separator_at(sibling_index).clone();
                            let new_separator =
                                entry.node.internal_borrow_from_right(&mut sibling, separator);
                            reparent.push((
                                *entry
                                    .node
                                    .children
                                    .last()
                                    .expect("internal node gained a child"),
                                node_page_id,
                            ));
                            new_separator
                        };
                        serialize_node(&sibling, &mut sibling_guard)?;
                        drop(sibling_guard);
                        self.buffer_pool.unpin_page(sibling_id, true);

                        parent.node.set_separator_at(sibling_index, new_separator);
                        parent.dirty = true;
                        entry.dirty = true;
                        merged = false;
                    }
                }
            }

            for (child_id, new_parent) in reparent {
                self.reparent_child(path, child_id, new_parent)?;
            }

            if merged {
                level -= 1;
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Root shrink cases: an emptied leaf root unsets the tree; an internal
    /// root left with a single child promotes that child.
    fn adjust_root(
        &self,
        path: &mut Vec<WritePathEntry<K, V>>,
        root_guard: &mut Option<RootWriteGuard>,
        txn: &Transaction,
    ) -> Result<(), BTreeError> {
        let root_is_leaf = path[0].node.is_leaf();
        let root_size = path[0].node.size();
        let old_root_id = path[0].guard.page_id;

        if root_is_leaf && root_size == 0 {
            path[0].dropped = true;
            txn.add_deleted_page(old_root_id);

            let guard = root_guard
                .as_mut()
                .expect("root latch held for root adjustment");
            **guard = INVALID_PAGE_ID;
            self.update_root_record(INVALID_PAGE_ID)?;
            return Ok(());
        }

        if !root_is_leaf && root_size == 1 {
            let only_child = path[0].node.child_at(0);
            path[0].dropped = true;
            txn.add_deleted_page(old_root_id);

            // The promoted child may still be write-latched further down our
            // own path; reparent_child updates it in place then.
            self.reparent_child(path, only_child, INVALID_PAGE_ID)?;

            let guard = root_guard
                .as_mut()
                .expect("root latch held for root adjustment");
            **guard = only_child;
            self.update_root_record(only_child)?;
        }

        Ok(())
    }
}
