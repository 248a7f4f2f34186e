//! Escrow for task payments.
//!
//! Funds never pass through the engine: a task's bid is locked in a hold
//! invoice on an external Lightning backend, then either settled to the
//! node or cancelled back to the principal. This crate defines the
//! [`EscrowBackend`] seam, the production HTTP client, and the retry
//! policy the lifecycle engine wraps every call in.

pub mod backend;
pub mod error;
pub mod http;
pub mod retry;

pub use backend::{EscrowBackend, HoldStatus};
pub use error::EscrowError;
pub use http::HttpEscrowBackend;
pub use retry::RetryPolicy;
