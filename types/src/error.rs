//! Caller-visible error kinds shared across crates.
//!
//! Each crate keeps its own `thiserror` enum; every variant maps to exactly
//! one `ErrorKind` so the API layer can report a stable, distinguishable
//! failure class.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The error classes a caller of the engine can observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Signature, attestation quote or nonce did not verify.
    BadSignature,
    /// Heartbeat timestamp too far from the engine's clock.
    ClockSkew,
    /// The node is not registered (or has no outstanding nonce).
    UnknownNode,
    /// No task with that id.
    UnknownTask,
    /// The requested transition is not legal from the task's current state.
    IllegalStateTransition,
    /// Per-node backpressure rejected the request.
    RateLimited,
    /// The node or verifier does not qualify for the operation.
    NotEligible,
    /// The caller's deadline passed before the operation completed.
    Timeout,
    /// The escrow backend or attestation engine could not be reached.
    BackendUnavailable,
    /// The escrow invoice is already settled, cancelled or expired.
    AlreadyTerminal,
    /// The input arrived too late (replayed heartbeat, proof after deadline).
    Stale,
    /// An internal invariant was broken. Never expected in production.
    InternalInvariantViolated,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadSignature => "BadSignature",
            Self::ClockSkew => "ClockSkew",
            Self::UnknownNode => "UnknownNode",
            Self::UnknownTask => "UnknownTask",
            Self::IllegalStateTransition => "IllegalStateTransition",
            Self::RateLimited => "RateLimited",
            Self::NotEligible => "NotEligible",
            Self::Timeout => "Timeout",
            Self::BackendUnavailable => "BackendUnavailable",
            Self::AlreadyTerminal => "AlreadyTerminal",
            Self::Stale => "Stale",
            Self::InternalInvariantViolated => "InternalInvariantViolated",
        }
    }

    /// Whether retrying the same call later can succeed without the caller
    /// changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable | Self::Timeout | Self::RateLimited
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
