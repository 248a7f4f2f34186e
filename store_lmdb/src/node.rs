//! LMDB implementation of NodeStore.

use proxy_store::{NodeStore, StoreError};
use proxy_types::{Node, NodeId};

use crate::{decode, encode, LmdbEnvironment, LmdbError};

impl NodeStore for LmdbEnvironment {
    fn put_node(&self, node: &Node) -> Result<(), StoreError> {
        let bytes = encode(node)?;
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.nodes_db
            .put(&mut wtxn, node.node_id.as_bytes(), &bytes)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn get_node(&self, node_id: &NodeId) -> Result<Option<Node>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        match self
            .nodes_db
            .get(&rtxn, node_id.as_bytes())
            .map_err(LmdbError::from)?
        {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn iter_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.nodes_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut result = Vec::new();
        for entry in iter {
            let (_, val) = entry.map_err(LmdbError::from)?;
            result.push(decode(val)?);
        }
        Ok(result)
    }

    fn node_count(&self) -> Result<u64, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        Ok(self.nodes_db.len(&rtxn).map_err(LmdbError::from)?)
    }
}
