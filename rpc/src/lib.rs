//! HTTP/JSON server for the engine.
//!
//! Provides endpoints for:
//! - Task lifecycle calls (post, accept, decline, start, proof, verdict, cancel)
//! - Node heartbeats, attestation nonces and standings
//! - Operator actions (retire, re-certify)
//! - Health and Prometheus metrics

pub mod error;
pub mod handlers;
pub mod pagination;
pub mod server;

pub use error::RpcError;
pub use server::RpcServer;
