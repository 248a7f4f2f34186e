//! Durable intents for multi-step escrow operations.
//!
//! An entry is appended before the engine calls the escrow backend and
//! completed (removed) once the matching task state is persisted. Entries
//! still pending at startup or on a tick are replayed.

use proxy_types::{CancelReason, InvoiceId, NodeId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Where a refunded task ends up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundTarget {
    /// A verifier failed the proof.
    Disputed,
    Cancelled(CancelReason),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// A hold was requested for a task that may not be persisted yet.
    Post { task_id: TaskId, invoice: Option<InvoiceId> },
    /// Pay the hold out to the node.
    Settle {
        task_id: TaskId,
        invoice: InvoiceId,
        payee: NodeId,
    },
    /// Return the hold to the principal.
    Refund {
        task_id: TaskId,
        invoice: InvoiceId,
        target: RefundTarget,
    },
}

impl JournalOp {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Post { task_id, .. }
            | Self::Settle { task_id, .. }
            | Self::Refund { task_id, .. } => *task_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub op: JournalOp,
    pub created_at: Timestamp,
}

pub trait JournalStore: Send + Sync {
    /// Persist an entry (or overwrite the entry with the same `seq`).
    fn put_entry(&self, entry: &JournalEntry) -> Result<(), StoreError>;

    /// Remove a completed entry. Completing an unknown entry is a no-op.
    fn complete_entry(&self, seq: u64) -> Result<(), StoreError>;

    /// Every incomplete entry, oldest first.
    fn pending_entries(&self) -> Result<Vec<JournalEntry>, StoreError>;

    /// Highest sequence number ever persisted, 0 if none.
    fn last_seq(&self) -> Result<u64, StoreError>;
}
