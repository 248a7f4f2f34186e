//! Node storage trait.

use proxy_types::{Node, NodeId};

use crate::StoreError;

pub trait NodeStore: Send + Sync {
    /// Insert or overwrite a node record.
    fn put_node(&self, node: &Node) -> Result<(), StoreError>;

    fn get_node(&self, node_id: &NodeId) -> Result<Option<Node>, StoreError>;

    fn iter_nodes(&self) -> Result<Vec<Node>, StoreError>;

    fn node_count(&self) -> Result<u64, StoreError> {
        self.iter_nodes().map(|v| v.len() as u64)
    }
}
