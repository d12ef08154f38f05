use std::sync::Arc;
use std::thread;

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::thread_rng;

mod common;
use common::{create_temp_db_file, create_test_buffer_pool};

use garnetdb::common::types::{Rid, INVALID_PAGE_ID};
use garnetdb::index::btree::{deserialize_node, BPlusTree, BTreeNode};
use garnetdb::storage::buffer::BufferPoolManager;
use garnetdb::transaction::concurrency::transaction::{IsolationLevel, Transaction};

fn rid(key: i64) -> Rid {
    Rid::new(key as u32, 0)
}

fn test_txn() -> Transaction {
    Transaction::new(1, IsolationLevel::RepeatableRead)
}

#[test]
fn test_insert_lookup_and_duplicate() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("idx_basic", buffer_pool, 4, 5)?;

    assert!(tree.is_empty());
    assert!(tree.insert(42, rid(42))?);
    assert!(!tree.is_empty());

    assert_eq!(tree.get_value(&42)?, Some(rid(42)));
    assert_eq!(tree.get_value(&7)?, None);

    // duplicate key is rejected, the original value stays
    assert!(!tree.insert(42, rid(999))?);
    assert_eq!(tree.get_value(&42)?, Some(rid(42)));

    Ok(())
}

#[test]
fn test_root_split_shape() -> Result<()> {
    // With leaf_max=4 and internal_max=5, keys 1..=5 split the root into
    // an internal node keyed [3] over leaves {1,2} and {3,4,5}.
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("idx_split", buffer_pool.clone(), 4, 5)?;

    for key in 1..=5i64 {
        assert!(tree.insert(key, rid(key))?);
    }

    let root_id = tree.root_page_id();
    assert_ne!(root_id, INVALID_PAGE_ID);

    let root_page = buffer_pool.fetch_page(root_id)?;
    let root: BTreeNode<i64, Rid> = deserialize_node(&root_page.read())?;
    buffer_pool.unpin_page(root_id, false);

    assert!(!root.is_leaf());
    assert_eq!(root.keys, vec![3]);
    assert_eq!(root.children.len(), 2);

    let left_page = buffer_pool.fetch_page(root.children[0])?;
    let left: BTreeNode<i64, Rid> = deserialize_node(&left_page.read())?;
    buffer_pool.unpin_page(root.children[0], false);
    assert_eq!(left.keys, vec![1, 2]);
    assert_eq!(left.next_page_id, root.children[1]);

    let right_page = buffer_pool.fetch_page(root.children[1])?;
    let right: BTreeNode<i64, Rid> = deserialize_node(&right_page.read())?;
    buffer_pool.unpin_page(root.children[1], false);
    assert_eq!(right.keys, vec![3, 4, 5]);
    assert_eq!(right.next_page_id, INVALID_PAGE_ID);

    let collected: Vec<i64> = tree.iter()?.map(|(key, _)| key).collect();
    assert_eq!(collected, vec![1, 2, 3, 4, 5]);

    Ok(())
}

#[test]
fn test_merge_collapses_root() -> Result<()> {
    // Removing 3 and 4 underflows the right leaf, merges it into {1,2,5}
    // and collapses the root to a single leaf.
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("idx_merge", buffer_pool.clone(), 4, 5)?;
    let txn = test_txn();

    for key in 1..=5i64 {
        tree.insert(key, rid(key))?;
    }
    tree.remove(&3, &txn)?;
    tree.remove(&4, &txn)?;

    assert!(!tree.is_empty());
    assert_eq!(tree.get_value(&3)?, None);
    assert_eq!(tree.get_value(&4)?, None);
    assert_eq!(tree.get_value(&5)?, Some(rid(5)));

    let root_id = tree.root_page_id();
    let root_page = buffer_pool.fetch_page(root_id)?;
    let root: BTreeNode<i64, Rid> = deserialize_node(&root_page.read())?;
    buffer_pool.unpin_page(root_id, false);

    assert!(root.is_leaf());
    assert_eq!(root.keys, vec![1, 2, 5]);

    Ok(())
}

#[test]
fn test_remove_is_idempotent() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("idx_idem", buffer_pool, 4, 5)?;
    let txn = test_txn();

    tree.insert(1, rid(1))?;
    tree.remove(&1, &txn)?;
    assert_eq!(tree.get_value(&1)?, None);

    // removing again (and removing from an empty tree) is a no-op
    tree.remove(&1, &txn)?;
    tree.remove(&99, &txn)?;

    Ok(())
}

#[test]
fn test_emptied_tree_resets_root() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("idx_empty", buffer_pool, 4, 5)?;
    let txn = test_txn();

    for key in 1..=5i64 {
        tree.insert(key, rid(key))?;
    }
    for key in 1..=5i64 {
        tree.remove(&key, &txn)?;
    }

    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);
    assert_eq!(tree.get_value(&1)?, None);
    assert_eq!(tree.iter()?.count(), 0);

    // the tree is usable again afterwards
    assert!(tree.insert(10, rid(10))?);
    assert_eq!(tree.get_value(&10)?, Some(rid(10)));

    Ok(())
}

#[test]
fn test_concurrent_inserts_both_land() -> Result<()> {
    // Two threads insert disjoint keys into a shared tree; both succeed
    // and both are visible in order.
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;
    let tree: Arc<BPlusTree<i64, Rid>> =
        Arc::new(BPlusTree::new("idx_concurrent", buffer_pool, 4, 5)?);

    let handles: Vec<_> = [100i64, 200i64]
        .into_iter()
        .map(|key| {
            let tree = tree.clone();
            thread::spawn(move || tree.insert(key, rid(key)).unwrap())
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }

    let collected: Vec<i64> = tree.iter()?.map(|(key, _)| key).collect();
    assert_eq!(collected, vec![100, 200]);

    Ok(())
}

#[test]
fn test_concurrent_bulk_inserts() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32)?;
    let tree: Arc<BPlusTree<i64, Rid>> =
        Arc::new(BPlusTree::new("idx_bulk", buffer_pool, 4, 5)?);

    let threads = 4;
    let per_thread = 50i64;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = tree.clone();
            thread::spawn(move || {
                for i in 0..per_thread {
                    let key = t as i64 * per_thread + i;
                    assert!(tree.insert(key, rid(key)).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected: Vec<i64> = (0..threads as i64 * per_thread).collect();
    let collected: Vec<i64> = tree.iter()?.map(|(key, _)| key).collect();
    assert_eq!(collected, expected);

    Ok(())
}

#[test]
fn test_root_page_id_persists_across_reopen() -> Result<()> {
    let (_temp_file, path) = create_temp_db_file()?;

    let root_before = {
        let buffer_pool = Arc::new(BufferPoolManager::new(10, &path)?);
        let tree: BPlusTree<i64, Rid> = BPlusTree::new("idx_reopen", buffer_pool.clone(), 4, 5)?;
        for key in 1..=5i64 {
            tree.insert(key, rid(key))?;
        }
        buffer_pool.flush_all_pages()?;
        tree.root_page_id()
    };

    let buffer_pool = Arc::new(BufferPoolManager::new(10, &path)?);
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("idx_reopen", buffer_pool, 4, 5)?;

    assert_eq!(tree.root_page_id(), root_before);
    for key in 1..=5i64 {
        assert_eq!(tree.get_value(&key)?, Some(rid(key)));
    }

    Ok(())
}

#[test]
fn test_iter_from_positions_mid_tree() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("idx_scan", buffer_pool, 4, 5)?;

    for key in (1..=20i64).rev() {
        tree.insert(key, rid(key))?;
    }

    let tail: Vec<i64> = tree.iter_from(&15)?.map(|(key, _)| key).collect();
    assert_eq!(tail, (15..=20).collect::<Vec<_>>());

    // a probe between keys starts at the next larger key
    tree.remove(&16, &test_txn())?;
    let tail: Vec<i64> = tree.iter_from(&16)?.map(|(key, _)| key).collect();
    assert_eq!(tail, vec![17, 18, 19, 20]);

    // past the rightmost key the scan is immediately exhausted
    assert_eq!(tree.iter_from(&21)?.count(), 0);

    Ok(())
}

#[test]
fn test_randomized_workload_stays_sorted() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("idx_random", buffer_pool, 4, 5)?;
    let txn = test_txn();

    let mut keys: Vec<i64> = (0..200).collect();
    keys.shuffle(&mut thread_rng());
    for &key in &keys {
        assert!(tree.insert(key, rid(key))?);
    }
    for key in 0..200i64 {
        assert_eq!(tree.get_value(&key)?, Some(rid(key)));
    }

    // remove the odd keys in random order, forcing merges and
    // redistributions at several levels
    let mut odd: Vec<i64> = (0..200).filter(|key| key % 2 == 1).collect();
    odd.shuffle(&mut thread_rng());
    for &key in &odd {
        tree.remove(&key, &txn)?;
    }

    for key in 0..200i64 {
        let expected = if key % 2 == 0 { Some(rid(key)) } else { None };
        assert_eq!(tree.get_value(&key)?, expected);
    }

    let collected: Vec<i64> = tree.iter()?.map(|(key, _)| key).collect();
    let expected: Vec<i64> = (0..200).filter(|key| key % 2 == 0).collect();
    assert_eq!(collected, expected);

    Ok(())
}
