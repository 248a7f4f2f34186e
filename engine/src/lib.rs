//! Node trust and task lifecycle engine.
//!
//! The engine is the coordinator that:
//! - Ingests signed heartbeats and registers attested nodes
//! - Sweeps the registry for silent nodes
//! - Matches open tasks to eligible nodes in offer rounds
//! - Drives tasks through accept, start, proof and verification
//! - Settles or refunds escrow holds through a replayable journal
//! - Applies reputation deltas for every outcome

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ingress;
pub mod journal;
pub mod lifecycle;
pub mod logging;
pub mod matcher;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod requests;
pub mod settlement;
pub mod shutdown;
pub mod taskbook;
pub mod verifiers;

pub use api::{InvariantPolicy, ProxyApi, RequestContext};
pub use config::{EngineConfig, TaskTypePolicy};
pub use engine::{Engine, EngineDeps, StartupReport};
pub use error::EngineError;
pub use events::{EngineEvent, EventBus};
pub use ingress::{HeartbeatIngress, SweepReport};
pub use lifecycle::LifecycleEngine;
pub use logging::{init_logging, LogFormat};
pub use metrics::EngineMetrics;
pub use registry::NodeRegistry;
pub use requests::{
    AttestedStep, CancelTaskRequest, DeclineTaskRequest, HeartbeatAck, IssueNonceRequest,
    NodeRequest, NodeStanding, NodeView, NonceResponse, PostTaskRequest, PostTaskResponse,
    SubmitProofRequest, TaskStatus, VerifyCallbackRequest,
};
pub use shutdown::ShutdownController;
pub use taskbook::TaskBook;
