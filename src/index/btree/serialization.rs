use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;

// Node encoding: 4-byte little-endian payload length, then the bincode body.
const LENGTH_PREFIX: usize = 4;

/// Serialize a B+Tree node into a page buffer.
pub fn serialize_node<K, V>(node: &BTreeNode<K, V>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord,
    V: Serialize + Clone,
{
    let body = bincode::serialize(node)
        .map_err(|e| BTreeError::SerializationError(e.to_string()))?;

    if LENGTH_PREFIX + body.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }

    page.data.fill(0);
    LittleEndian::write_u32(&mut page.data[0..LENGTH_PREFIX], body.len() as u32);
    page.data[LENGTH_PREFIX..LENGTH_PREFIX + body.len()].copy_from_slice(&body);

    Ok(())
}

/// Deserialize a B+Tree node from a page buffer.
pub fn deserialize_node<K, V>(page: &Page) -> Result<BTreeNode<K, V>, BTreeError>
where
    K: DeserializeOwned + Clone + Ord,
    V: DeserializeOwned + Clone,
{
    let body_len = LittleEndian::read_u32(&page.data[0..LENGTH_PREFIX]) as usize;
    if body_len == 0 || LENGTH_PREFIX + body_len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }

    bincode::deserialize(&page.data[LENGTH_PREFIX..LENGTH_PREFIX + body_len])
        .map_err(|e| BTreeError::DeserializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{INVALID_PAGE_ID, Rid};

    #[test]
    fn test_leaf_node_roundtrip() {
        let mut node: BTreeNode<i64, Rid> = BTreeNode::new_leaf(64, 3);
        node.leaf_insert(10, Rid::new(1, 0));
        node.leaf_insert(20, Rid::new(1, 1));
        node.next_page_id = 9;

        let mut page = Page::new(7);
        serialize_node(&node, &mut page).unwrap();
        let decoded: BTreeNode<i64, Rid> = deserialize_node(&page).unwrap();

        assert!(decoded.is_leaf());
        assert_eq!(decoded.keys, vec![10, 20]);
        assert_eq!(decoded.values, vec![Rid::new(1, 0), Rid::new(1, 1)]);
        assert_eq!(decoded.parent_page_id, 3);
        assert_eq!(decoded.next_page_id, 9);
        assert_eq!(decoded.max_size, 64);
    }

    #[test]
    fn test_internal_node_roundtrip() {
        let mut node: BTreeNode<String, Rid> = BTreeNode::new_internal(8, INVALID_PAGE_ID);
        node.keys = vec!["m".to_string()];
        node.children = vec![4, 5];

        let mut page = Page::new(2);
        serialize_node(&node, &mut page).unwrap();
        let decoded: BTreeNode<String, Rid> = deserialize_node(&page).unwrap();

        assert!(!decoded.is_leaf());
        assert_eq!(decoded.keys, vec!["m".to_string()]);
        assert_eq!(decoded.children, vec![4, 5]);
    }

    #[test]
    fn test_node_too_large_is_rejected() {
        let mut node: BTreeNode<String, Rid> = BTreeNode::new_leaf(1 << 16, INVALID_PAGE_ID);
        for i in 0..PAGE_SIZE {
            node.keys.push(format!("key-{i:08}"));
            node.values.push(Rid::new(i as u32, 0));
        }

        let mut page = Page::new(1);
        assert!(matches!(
            serialize_node(&node, &mut page),
            Err(BTreeError::NodeTooLarge)
        ));
    }

    #[test]
    fn test_unformatted_page_is_rejected() {
        let page = Page::new(1);
        assert!(matches!(
            deserialize_node::<i64, Rid>(&page),
            Err(BTreeError::InvalidPageFormat)
        ));
    }
}
