//! Durable intents for escrow operations.
//!
//! An entry is written before the escrow call and completed after the
//! task reflects its outcome. Entries still pending after a crash, or
//! after retries were exhausted, are replayed by the lifecycle engine.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use proxy_store::{JournalEntry, JournalOp, Store};
use proxy_types::{Clock, IdSource, TaskId};

use crate::EngineError;

pub struct Journal {
    store: Arc<dyn Store>,
    ids: Arc<dyn IdSource>,
    clock: Arc<dyn Clock>,
    /// Entries whose operation is running in this process.
    active: Mutex<HashSet<u64>>,
}

impl Journal {
    pub fn new(store: Arc<dyn Store>, ids: Arc<dyn IdSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ids,
            clock,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Record a new intent and mark it active until the guard drops.
    pub fn begin(&self, op: JournalOp) -> Result<JournalGuard<'_>, EngineError> {
        let entry = JournalEntry {
            seq: self.ids.next_journal_seq(),
            op,
            created_at: self.clock.now(),
        };
        self.store.put_entry(&entry)?;
        self.mark_active(entry.seq);
        Ok(JournalGuard {
            journal: self,
            entry,
        })
    }

    /// Take over an existing pending entry for replay. `None` if it is
    /// already being worked on.
    pub fn resume(&self, entry: JournalEntry) -> Option<JournalGuard<'_>> {
        let fresh = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.seq);
        fresh.then_some(JournalGuard {
            journal: self,
            entry,
        })
    }

    /// Pending entries not owned by a running operation, oldest first.
    pub fn pending(&self) -> Result<Vec<JournalEntry>, EngineError> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<JournalEntry> = self
            .store
            .pending_entries()?
            .into_iter()
            .filter(|e| !active.contains(&e.seq))
            .collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Whether any settle or refund for `task_id` is still pending.
    pub fn has_pending_for(&self, task_id: &TaskId) -> Result<bool, EngineError> {
        Ok(self.store.pending_entries()?.iter().any(|e| {
            e.op.task_id() == *task_id && !matches!(e.op, JournalOp::Post { .. })
        }))
    }

    fn mark_active(&self, seq: u64) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq);
    }
}

/// A journal entry owned by one running operation.
pub struct JournalGuard<'a> {
    journal: &'a Journal,
    entry: JournalEntry,
}

impl JournalGuard<'_> {
    pub fn op(&self) -> &JournalOp {
        &self.entry.op
    }

    pub fn seq(&self) -> u64 {
        self.entry.seq
    }

    /// Overwrite the entry's operation (e.g. once the invoice id is known).
    pub fn record(&mut self, op: JournalOp) -> Result<(), EngineError> {
        self.entry.op = op;
        self.journal.store.put_entry(&self.entry)?;
        Ok(())
    }

    /// The operation's effects are durable; drop the intent.
    pub fn complete(self) -> Result<(), EngineError> {
        self.journal.store.complete_entry(self.entry.seq)?;
        Ok(())
    }
}

impl Drop for JournalGuard<'_> {
    fn drop(&mut self) {
        self.journal
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.entry.seq);
    }
}
