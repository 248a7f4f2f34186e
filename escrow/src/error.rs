use proxy_types::{ErrorKind, InvoiceId};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscrowError {
    #[error("escrow backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invoice {0} is already settled, cancelled or expired")]
    AlreadyTerminal(InvoiceId),

    #[error("unknown invoice {0}")]
    UnknownInvoice(InvoiceId),

    #[error("escrow backend rejected the request: {0}")]
    Rejected(String),
}

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::AlreadyTerminal(_) => ErrorKind::AlreadyTerminal,
            // The engine only ever names invoices it created.
            Self::UnknownInvoice(_) | Self::Rejected(_) => ErrorKind::InternalInvariantViolated,
        }
    }

    /// Only an unreachable backend is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}
