use proxy_types::{ErrorKind, NodeId, Timestamp};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttestError {
    #[error("bad signature: {0}")]
    BadSignature(String),

    #[error("clock skew of {skew_secs}s exceeds the limit")]
    ClockSkew { skew_secs: u64 },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("nonce expired")]
    NonceExpired,

    #[error("node {0} already holds the maximum number of outstanding nonces")]
    TooManyNonces(NodeId),

    #[error("quote invalid: {0}")]
    QuoteInvalid(String),

    #[error("heartbeat at {got} is not after the last accepted one at {last}")]
    Stale { last: Timestamp, got: Timestamp },

    #[error("attestation engine unavailable: {0}")]
    Unavailable(String),
}

impl AttestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadSignature(_) | Self::NonceExpired | Self::QuoteInvalid(_) => {
                ErrorKind::BadSignature
            }
            Self::ClockSkew { .. } => ErrorKind::ClockSkew,
            Self::UnknownNode(_) => ErrorKind::UnknownNode,
            Self::Stale { .. } => ErrorKind::Stale,
            Self::TooManyNonces(_) => ErrorKind::RateLimited,
            Self::Unavailable(_) => ErrorKind::BackendUnavailable,
        }
    }
}
