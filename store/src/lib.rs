//! Abstract storage traits for the proxy network engine.
//!
//! Every storage backend (LMDB in production, in-memory for testing)
//! implements these traits. The engine depends only on the traits.

pub mod error;
pub mod idempotency;
pub mod journal;
pub mod meta;
pub mod node;
pub mod task;

pub use error::StoreError;
pub use idempotency::IdempotencyStore;
pub use journal::{JournalEntry, JournalOp, JournalStore, RefundTarget};
pub use meta::MetaStore;
pub use node::NodeStore;
pub use task::TaskStore;

/// Everything the engine persists, behind one handle.
pub trait Store: NodeStore + TaskStore + JournalStore + IdempotencyStore + MetaStore {
    /// Force buffered writes to durable storage.
    fn flush(&self) -> Result<(), StoreError>;
}
