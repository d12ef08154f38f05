pub mod error;
pub mod index;
pub mod node;
pub mod serialization;

pub use error::BTreeError;
pub use index::BPlusTree;
pub use node::{BTreeNode, NodeType};
pub use serialization::{deserialize_node, serialize_node};
