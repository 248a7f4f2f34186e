//! Hardware attestation and heartbeat authentication.
//!
//! The [`Attestor`] issues single-use challenge nonces, checks TPM quotes
//! through an external [`QuoteEngine`], and authenticates heartbeat
//! envelopes (HMAC under a per-node key, or a TPM quote for tier-3 nodes).

pub mod attestor;
pub mod envelope;
pub mod error;
pub mod keyring;
pub mod nonce;
pub mod quote;

pub use attestor::{Attestor, HeartbeatVerdict, TpmAttestor};
pub use envelope::{HeartbeatEnvelope, Registration};
pub use error::AttestError;
pub use keyring::{Enrollment, KeyRing};
pub use nonce::NonceCache;
pub use quote::{AttestationResult, QuoteEngine, SubprocessQuoteEngine};
