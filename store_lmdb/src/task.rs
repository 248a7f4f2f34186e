//! LMDB implementation of TaskStore.

use proxy_store::{StoreError, TaskStore};
use proxy_types::{NodeId, PhysicalTask, TaskId};

use crate::{decode, encode, LmdbEnvironment, LmdbError};

fn index_key(node_id: &NodeId, task_id: &TaskId) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(node_id.as_bytes());
    key[16..].copy_from_slice(task_id.as_bytes());
    key
}

impl TaskStore for LmdbEnvironment {
    fn put_task(&self, task: &PhysicalTask) -> Result<(), StoreError> {
        let bytes = encode(task)?;
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.tasks_db
            .put(&mut wtxn, task.task_id.as_bytes(), &bytes)
            .map_err(LmdbError::from)?;
        if let Some(node_id) = task.assigned_node_id() {
            self.node_tasks_db
                .put(&mut wtxn, &index_key(&node_id, &task.task_id), &[])
                .map_err(LmdbError::from)?;
        }
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn get_task(&self, task_id: &TaskId) -> Result<Option<PhysicalTask>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        match self
            .tasks_db
            .get(&rtxn, task_id.as_bytes())
            .map_err(LmdbError::from)?
        {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn iter_tasks(&self) -> Result<Vec<PhysicalTask>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.tasks_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut result = Vec::new();
        for entry in iter {
            let (_, val) = entry.map_err(LmdbError::from)?;
            result.push(decode(val)?);
        }
        Ok(result)
    }

    fn tasks_for_node(&self, node_id: &NodeId) -> Result<Vec<TaskId>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self
            .node_tasks_db
            .prefix_iter(&rtxn, &node_id.as_bytes()[..])
            .map_err(LmdbError::from)?;
        let mut result = Vec::new();
        for entry in iter {
            let (key, _) = entry.map_err(LmdbError::from)?;
            let task: [u8; 16] = key
                .get(16..32)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| LmdbError::Corruption("node_tasks key length".into()))?;
            result.push(TaskId::new(task));
        }
        Ok(result)
    }
}
