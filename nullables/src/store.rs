//! Nullable store: thread-safe in-memory storage for testing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use proxy_store::idempotency::idempotency_key;
use proxy_store::{
    IdempotencyStore, JournalEntry, JournalStore, MetaStore, NodeStore, Store, StoreError,
    TaskStore,
};
use proxy_types::{Node, NodeId, PhysicalTask, TaskId, Timestamp};

/// An in-memory implementation of every store trait.
/// Thread-safe for use with tokio's multi-threaded runtime.
#[derive(Default)]
pub struct NullStore {
    nodes: Mutex<HashMap<NodeId, Node>>,
    tasks: Mutex<HashMap<TaskId, PhysicalTask>>,
    node_tasks: Mutex<BTreeSet<(NodeId, TaskId)>>,
    journal: Mutex<BTreeMap<u64, JournalEntry>>,
    last_seq: Mutex<u64>,
    responses: Mutex<HashMap<Vec<u8>, (Timestamp, Vec<u8>)>>,
    meta: Mutex<HashMap<String, Vec<u8>>>,
}

impl NullStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for NullStore {
    fn put_node(&self, node: &Node) -> Result<(), StoreError> {
        self.nodes.lock().unwrap().insert(node.node_id, node.clone());
        Ok(())
    }

    fn get_node(&self, node_id: &NodeId) -> Result<Option<Node>, StoreError> {
        Ok(self.nodes.lock().unwrap().get(node_id).cloned())
    }

    fn iter_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }
}

impl TaskStore for NullStore {
    fn put_task(&self, task: &PhysicalTask) -> Result<(), StoreError> {
        if let Some(node_id) = task.assigned_node_id() {
            self.node_tasks
                .lock()
                .unwrap()
                .insert((node_id, task.task_id));
        }
        self.tasks.lock().unwrap().insert(task.task_id, task.clone());
        Ok(())
    }

    fn get_task(&self, task_id: &TaskId) -> Result<Option<PhysicalTask>, StoreError> {
        Ok(self.tasks.lock().unwrap().get(task_id).cloned())
    }

    fn iter_tasks(&self) -> Result<Vec<PhysicalTask>, StoreError> {
        Ok(self.tasks.lock().unwrap().values().cloned().collect())
    }

    fn tasks_for_node(&self, node_id: &NodeId) -> Result<Vec<TaskId>, StoreError> {
        Ok(self
            .node_tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == node_id)
            .map(|(_, t)| *t)
            .collect())
    }
}

impl JournalStore for NullStore {
    fn put_entry(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        self.journal.lock().unwrap().insert(entry.seq, entry.clone());
        let mut last = self.last_seq.lock().unwrap();
        *last = (*last).max(entry.seq);
        Ok(())
    }

    fn complete_entry(&self, seq: u64) -> Result<(), StoreError> {
        self.journal.lock().unwrap().remove(&seq);
        Ok(())
    }

    fn pending_entries(&self) -> Result<Vec<JournalEntry>, StoreError> {
        Ok(self.journal.lock().unwrap().values().cloned().collect())
    }

    fn last_seq(&self) -> Result<u64, StoreError> {
        Ok(*self.last_seq.lock().unwrap())
    }
}

impl IdempotencyStore for NullStore {
    fn get_response(
        &self,
        caller_id: &str,
        request_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(&idempotency_key(caller_id, request_id))
            .map(|(_, r)| r.clone()))
    }

    fn put_response(
        &self,
        caller_id: &str,
        request_id: &str,
        response: &[u8],
        recorded_at: Timestamp,
    ) -> Result<(), StoreError> {
        self.responses.lock().unwrap().insert(
            idempotency_key(caller_id, request_id),
            (recorded_at, response.to_vec()),
        );
        Ok(())
    }

    fn purge_responses_before(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
        let mut responses = self.responses.lock().unwrap();
        let before = responses.len();
        responses.retain(|_, (at, _)| *at >= cutoff);
        Ok(before - responses.len())
    }
}

impl MetaStore for NullStore {
    fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.meta
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.meta.lock().unwrap().get(key).cloned())
    }
}

impl Store for NullStore {
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
