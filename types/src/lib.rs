//! Fundamental types for the proxy network engine.
//!
//! This crate defines the core types shared across every other crate in the workspace:
//! identifiers, timestamps, amounts, tiers, geofences, the node and task models,
//! protocol parameters, and the caller-visible error kinds.

pub mod amount;
pub mod error;
pub mod geo;
pub mod ids;
pub mod node;
pub mod params;
pub mod serde_hex;
pub mod state;
pub mod task;
pub mod time;

pub use amount::Sats;
pub use error::ErrorKind;
pub use geo::Geofence;
pub use ids::{Fingerprint, IdSource, InvoiceId, Nonce, NodeId, ParseIdError, TaskId, VerifierId};
pub use node::{HeartbeatSecret, MissLedger, Node, RollingStats, StatTotals, Telemetry};
pub use params::ProtocolParams;
pub use state::{NodeStatus, Tier};
pub use task::{
    CancelReason, Decision, MatchProgress, PhysicalTask, SettlementOutcome, TaskState,
    TaskStateKind,
};
pub use time::{Clock, SystemClock, Timestamp};
