//! Task storage trait.

use proxy_types::{NodeId, PhysicalTask, TaskId};

use crate::StoreError;

/// Persistent tasks plus the node -> tasks secondary index.
///
/// The index records every node a task was ever assigned to; entries are
/// never removed, so a node's history survives reassignment.
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite a task, indexing its assigned node if any.
    fn put_task(&self, task: &PhysicalTask) -> Result<(), StoreError>;

    fn get_task(&self, task_id: &TaskId) -> Result<Option<PhysicalTask>, StoreError>;

    fn iter_tasks(&self) -> Result<Vec<PhysicalTask>, StoreError>;

    /// Ids of every task ever assigned to `node_id`, in id order.
    fn tasks_for_node(&self, node_id: &NodeId) -> Result<Vec<TaskId>, StoreError>;
}
