use proxy_attestation::AttestError;
use proxy_escrow::EscrowError;
use proxy_store::StoreError;
use proxy_types::{ErrorKind, NodeId, TaskId, TaskStateKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("attestation: {0}")]
    Attest(#[from] AttestError),

    #[error("escrow: {0}")]
    Escrow(#[from] EscrowError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {task_id}: {from} -> {to} is not a legal transition")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskStateKind,
        to: TaskStateKind,
    },

    #[error("task {0} has a settlement in progress")]
    Busy(TaskId),

    #[error("node {0} is sending heartbeats too fast")]
    RateLimited(NodeId),

    #[error("request {0} is already being processed")]
    InFlight(String),

    #[error("not eligible: {0}")]
    NotEligible(String),

    #[error("bad signature: {0}")]
    BadSignature(String),

    #[error("too late: {0}")]
    Stale(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl EngineError {
    pub fn illegal(task_id: TaskId, from: TaskStateKind, to: TaskStateKind) -> Self {
        Self::IllegalTransition { task_id, from, to }
    }

    /// The caller-visible class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Attest(e) => e.kind(),
            Self::Escrow(e) => e.kind(),
            Self::UnknownNode(_) => ErrorKind::UnknownNode,
            Self::UnknownTask(_) => ErrorKind::UnknownTask,
            Self::IllegalTransition { .. } | Self::Busy(_) => ErrorKind::IllegalStateTransition,
            Self::RateLimited(_) | Self::InFlight(_) => ErrorKind::RateLimited,
            Self::NotEligible(_) => ErrorKind::NotEligible,
            Self::BadSignature(_) => ErrorKind::BadSignature,
            Self::Stale(_) => ErrorKind::Stale,
            Self::Timeout => ErrorKind::Timeout,
            Self::Store(_) | Self::Invariant(_) | Self::Config(_) | Self::Metrics(_) => {
                ErrorKind::InternalInvariantViolated
            }
        }
    }
}
