//! The escrow backend contract.

use async_trait::async_trait;
use proxy_types::{InvoiceId, NodeId, Sats, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EscrowError;

/// State of a hold invoice on the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    Held,
    Settled,
    Cancelled,
    Expired,
}

impl HoldStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Held)
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Held => "HELD",
            Self::Settled => "SETTLED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// Opaque interface to the Lightning hold-invoice backend.
///
/// `settle` and `cancel` are idempotent: repeating the call that already
/// succeeded returns `Ok`, while the opposite terminal call fails with
/// [`EscrowError::AlreadyTerminal`].
#[async_trait]
pub trait EscrowBackend: Send + Sync {
    /// Lock `amount` until `expires_at`.
    async fn create_hold(&self, amount: Sats, expires_at: Timestamp)
        -> Result<InvoiceId, EscrowError>;

    /// Release the hold to `payee`.
    async fn settle(&self, invoice: &InvoiceId, payee: &NodeId) -> Result<(), EscrowError>;

    /// Return the hold to the principal.
    async fn cancel(&self, invoice: &InvoiceId) -> Result<(), EscrowError>;

    async fn status(&self, invoice: &InvoiceId) -> Result<HoldStatus, EscrowError>;

    /// Cheap reachability check used at startup.
    async fn ping(&self) -> Result<(), EscrowError>;
}
