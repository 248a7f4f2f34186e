//! In-memory task book over the persistent task store.
//!
//! Holds one mutex per task, the ordered deadline index the tick pops
//! from, the node -> task reservation map the matcher relies on, and the
//! settlement claims that serialise escrow calls per task.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use proxy_store::Store;
use proxy_types::{NodeId, PhysicalTask, TaskId, TaskStateKind, Timestamp};

use crate::EngineError;

/// Outcome of a successful [`TaskBook::update`].
#[derive(Debug)]
pub struct Updated<R> {
    pub value: R,
    /// State kind before the update.
    pub from: TaskStateKind,
    /// The task as persisted.
    pub task: PhysicalTask,
}

impl<R> Updated<R> {
    pub fn transitioned(&self) -> bool {
        self.from != self.task.state.kind()
    }
}

/// `(deadline_at, task_id)` ordered index.
#[derive(Default)]
struct DeadlineIndex {
    by_time: BTreeSet<(Timestamp, TaskId)>,
    by_task: HashMap<TaskId, Timestamp>,
}

impl DeadlineIndex {
    fn set(&mut self, task_id: TaskId, deadline: Option<Timestamp>) {
        if let Some(old) = self.by_task.remove(&task_id) {
            self.by_time.remove(&(old, task_id));
        }
        if let Some(at) = deadline {
            self.by_time.insert((at, task_id));
            self.by_task.insert(task_id, at);
        }
    }

    fn pop_due(&mut self, now: Timestamp) -> Vec<TaskId> {
        let mut due = Vec::new();
        while let Some(&(at, task_id)) = self.by_time.first() {
            if at > now {
                break;
            }
            self.by_time.remove(&(at, task_id));
            self.by_task.remove(&task_id);
            due.push(task_id);
        }
        due
    }
}

/// Exclusive right to settle or cancel one task. Released on drop.
pub struct TaskClaim<'a> {
    book: &'a TaskBook,
    task_id: TaskId,
}

impl TaskClaim<'_> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Drop for TaskClaim<'_> {
    fn drop(&mut self) {
        self.book
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

pub struct TaskBook {
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<PhysicalTask>>>>,
    deadlines: Mutex<DeadlineIndex>,
    /// Node -> the non-terminal task it is assigned to.
    assignments: Mutex<HashMap<NodeId, TaskId>>,
    claims: Mutex<HashSet<TaskId>>,
    /// Tasks with a settle or refund journalled but not yet applied. They
    /// stay frozen across claims until the entry completes.
    settling: Mutex<HashSet<TaskId>>,
    store: Arc<dyn Store>,
}

impl TaskBook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            deadlines: Mutex::new(DeadlineIndex::default()),
            assignments: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashSet::new()),
            settling: Mutex::new(HashSet::new()),
            store,
        }
    }

    /// Warm the book from the store. Returns the number of tasks loaded.
    pub fn load(&self) -> Result<usize, EngineError> {
        let loaded = self.store.iter_tasks()?;
        let count = loaded.len();
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let mut deadlines = self.deadlines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut assignments = self
            .assignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for task in loaded {
            if let Some(node_id) = busy_node(&task) {
                assignments.insert(node_id, task.task_id);
            }
            deadlines.set(task.task_id, live_deadline(&task));
            tasks.insert(task.task_id, Arc::new(Mutex::new(task)));
        }
        Ok(count)
    }

    /// Persist and index a new task.
    pub fn insert(&self, task: PhysicalTask) -> Result<(), EngineError> {
        task.check_invariants().map_err(EngineError::Invariant)?;
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(&task.task_id) {
            return Err(EngineError::Invariant(format!(
                "task id {} issued twice",
                task.task_id
            )));
        }
        self.store.put_task(&task)?;
        self.deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(task.task_id, live_deadline(&task));
        tasks.insert(task.task_id, Arc::new(Mutex::new(task)));
        Ok(())
    }

    pub fn get(&self, task_id: &TaskId) -> Option<PhysicalTask> {
        let slot = self.slot(task_id)?;
        let task = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(task.clone())
    }

    /// Every task the node was ever assigned, oldest first.
    pub fn tasks_for_node(&self, node_id: &NodeId) -> Result<Vec<PhysicalTask>, EngineError> {
        let mut tasks: Vec<PhysicalTask> = self
            .store
            .tasks_for_node(node_id)?
            .iter()
            .filter_map(|id| self.get(id))
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.task_id));
        Ok(tasks)
    }

    /// Mutate a task that is not being settled. See [`TaskBook::update_claimed`].
    pub fn update<R>(
        &self,
        task_id: &TaskId,
        f: impl FnOnce(&mut PhysicalTask) -> Result<R, EngineError>,
    ) -> Result<Updated<R>, EngineError> {
        self.apply(task_id, false, f)
    }

    /// Mutate a task under a settlement claim.
    pub fn update_claimed<R>(
        &self,
        claim: &TaskClaim<'_>,
        f: impl FnOnce(&mut PhysicalTask) -> Result<R, EngineError>,
    ) -> Result<Updated<R>, EngineError> {
        self.apply(&claim.task_id, true, f)
    }

    /// Take the settlement claim of a task, failing with `Busy` if another
    /// settlement holds it.
    pub fn claim(&self, task_id: &TaskId) -> Result<TaskClaim<'_>, EngineError> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if !claims.insert(*task_id) {
            return Err(EngineError::Busy(*task_id));
        }
        Ok(TaskClaim {
            book: self,
            task_id: *task_id,
        })
    }

    /// Freeze a task behind a journalled settle or refund.
    pub fn mark_settling(&self, task_id: &TaskId) {
        self.settling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*task_id);
    }

    /// The task's settle or refund entry completed.
    pub fn clear_settling(&self, task_id: &TaskId) {
        self.settling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    pub fn is_settling(&self, task_id: &TaskId) -> bool {
        self.settling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task_id)
    }

    /// Remove and return every task whose deadline is at or before `now`.
    pub fn pop_due(&self, now: Timestamp) -> Vec<TaskId> {
        self.deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_due(now)
    }

    /// Re-insert a task's current deadline (after a handler ran or failed).
    pub fn reindex(&self, task_id: &TaskId) {
        let deadline = self.get(task_id).and_then(|t| live_deadline(&t));
        self.deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(*task_id, deadline);
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_time
            .first()
            .map(|(at, _)| *at)
    }

    /// Nodes currently assigned to a non-terminal task.
    pub fn busy_nodes(&self) -> HashSet<NodeId> {
        self.assignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Tasks not yet SETTLED or CANCELLED.
    pub fn open_count(&self) -> usize {
        let slots: Vec<_> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter(|slot| {
                !slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .state
                    .is_terminal()
            })
            .count()
    }

    fn apply<R>(
        &self,
        task_id: &TaskId,
        claimed: bool,
        f: impl FnOnce(&mut PhysicalTask) -> Result<R, EngineError>,
    ) -> Result<Updated<R>, EngineError> {
        let slot = self
            .slot(task_id)
            .ok_or(EngineError::UnknownTask(*task_id))?;
        let mut current = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed
            && (self
                .claims
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(task_id)
                || self.is_settling(task_id))
        {
            return Err(EngineError::Busy(*task_id));
        }

        let from = current.state.kind();
        let mut next = current.clone();
        let value = f(&mut next)?;
        if next == *current {
            return Ok(Updated {
                value,
                from,
                task: next,
            });
        }

        let to = next.state.kind();
        if from != to && !from.can_transition_to(to) {
            return Err(EngineError::illegal(*task_id, from, to));
        }
        next.check_invariants().map_err(EngineError::Invariant)?;
        next.version = current.version + 1;

        {
            let mut assignments = self
                .assignments
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let before = busy_node(&current);
            let after = busy_node(&next);
            if let Some(node_id) = after {
                if let Some(other) = assignments.get(&node_id) {
                    if other != task_id {
                        return Err(EngineError::NotEligible(format!(
                            "node {node_id} is already assigned to task {other}"
                        )));
                    }
                }
            }
            self.store.put_task(&next)?;
            if let Some(node_id) = before {
                if assignments.get(&node_id) == Some(task_id) {
                    assignments.remove(&node_id);
                }
            }
            if let Some(node_id) = after {
                assignments.insert(node_id, *task_id);
            }
        }

        self.deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(*task_id, live_deadline(&next));
        *current = next.clone();
        Ok(Updated {
            value,
            from,
            task: next,
        })
    }

    fn slot(&self, task_id: &TaskId) -> Option<Arc<Mutex<PhysicalTask>>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }
}

fn busy_node(task: &PhysicalTask) -> Option<NodeId> {
    if task.state.is_terminal() {
        None
    } else {
        task.assigned_node_id()
    }
}

fn live_deadline(task: &PhysicalTask) -> Option<Timestamp> {
    if task.state.is_terminal() {
        None
    } else {
        task.deadline_at
    }
}
