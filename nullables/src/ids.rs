//! Nullable id source: sequential, predictable ids.

use proxy_types::{IdSource, TaskId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Task ids `1, 2, 3, ...` (big-endian in the low 8 bytes).
#[derive(Default)]
pub struct NullIds {
    tasks: AtomicU64,
    journal: AtomicU64,
}

impl NullIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the n-th call (1-based) to `next_task_id` returns.
    pub fn task_id(n: u64) -> TaskId {
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        TaskId::new(bytes)
    }
}

impl IdSource for NullIds {
    fn next_task_id(&self) -> TaskId {
        Self::task_id(self.tasks.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn next_journal_seq(&self) -> u64 {
        self.journal.fetch_add(1, Ordering::SeqCst) + 1
    }
}
