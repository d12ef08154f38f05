use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::deserialize_node;

use super::base::BPlusTree;

/// Forward iterator over the sorted leaf chain.
///
/// Carries only `(leaf_page_id, slot)` between steps; every `next()` fetches
/// the leaf, reads one entry under its read latch and unpins again. The
/// iterator is exhausted once the slot index runs off the rightmost leaf.
pub struct BPlusTreeIter<'a, K, V> {
    tree: &'a BPlusTree<K, V>,
    leaf_page_id: PageId,
    slot: usize,
}

impl<K, V> Iterator for BPlusTreeIter<'_, K, V>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if self.leaf_page_id == INVALID_PAGE_ID {
                return None;
            }

            let page = match self.tree.buffer_pool.fetch_page(self.leaf_page_id) {
                Ok(page) => page,
                Err(_) => {
                    self.leaf_page_id = INVALID_PAGE_ID;
                    return None;
                }
            };

            let mut item = None;
            let mut next_leaf = None;
            {
                let guard = page.read();
                match deserialize_node::<K, V>(&guard) {
                    Ok(node) => {
                        if self.slot < node.keys.len() {
                            item = Some((
                                node.keys[self.slot].clone(),
                                node.values[self.slot].clone(),
                            ));
                        } else {
                            next_leaf = Some(node.next_page_id);
                        }
                    }
                    Err(_) => next_leaf = Some(INVALID_PAGE_ID),
                }
            }
            self.tree.buffer_pool.unpin_page(self.leaf_page_id, false);

            if let Some(item) = item {
                self.slot += 1;
                return Some(item);
            }

            // Slot ran off this leaf: follow the sibling chain.
            self.leaf_page_id = next_leaf.expect("either an item or a next leaf");
            self.slot = 0;
        }
    }
}

impl<K, V> BPlusTree<K, V>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Iterate from the first entry of the tree.
    pub fn iter(&self) -> Result<BPlusTreeIter<'_, K, V>, BTreeError> {
        self.positioned_iter(None)
    }

    /// Iterate from the first entry with key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<BPlusTreeIter<'_, K, V>, BTreeError> {
        self.positioned_iter(Some(key))
    }

    /// Read-crab down to the starting leaf and record its position; the
    /// iterator itself holds no latch between steps.
    fn positioned_iter(&self, key: Option<&K>) -> Result<BPlusTreeIter<'_, K, V>, BTreeError> {
        let root_guard = self.root.read_arc();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(BPlusTreeIter {
                tree: self,
                leaf_page_id: INVALID_PAGE_ID,
                slot: 0,
            });
        }

        let page = self.buffer_pool.fetch_page(*root_guard)?;
        let mut guard = page.read_arc();
        drop(root_guard);

        loop {
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;
            if node.is_leaf() {
                let leaf_page_id = guard.page_id;
                let slot = match key {
                    Some(key) => node.key_index(key),
                    None => 0,
                };
                drop(guard);
                self.buffer_pool.unpin_page(leaf_page_id, false);
                return Ok(BPlusTreeIter {
                    tree: self,
                    leaf_page_id,
                    slot,
                });
            }

            let child_id = match key {
                Some(key) => node.child_lookup(key),
                None => node.child_at(0),
            };
            let child_page = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_page.read_arc();

            let parent_id = guard.page_id;
            drop(guard);
            self.buffer_pool.unpin_page(parent_id, false);
            guard = child_guard;
        }
    }
}
