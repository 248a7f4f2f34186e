//! Reputation scoring for operator nodes.
//!
//! Scores live in `[0, max_reputation]` and every change goes through
//! [`ReputationEngine::apply`], which also re-derives the node's status:
//! below `suspend_below` SUSPENDED, below `probation_below` PROBATION,
//! otherwise ACTIVE. RETIRED is terminal and ignores every event.
//!
//! A SUSPENDED node cannot climb out on its own: positive deltas stop one
//! point short of the suspension threshold until an operator re-certifies
//! it.

pub mod engine;
pub mod event;

pub use engine::{ReputationChange, ReputationEngine};
pub use event::ReputationEvent;
