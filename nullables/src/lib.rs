//! Nullable infrastructure for deterministic testing.
//!
//! Every external dependency of the engine (clock, id source, storage,
//! escrow backend, TPM quote engine) sits behind a trait. This crate
//! provides test implementations that:
//! - Return deterministic values
//! - Can be controlled programmatically (advance time, take a backend down)
//! - Never touch the filesystem, the network or a subprocess
//!
//! Usage: swap real implementations for nullables in tests.

pub mod clock;
pub mod device;
pub mod escrow;
pub mod ids;
pub mod quote;
pub mod store;

pub use clock::NullClock;
pub use device::NullDevice;
pub use escrow::NullEscrow;
pub use ids::NullIds;
pub use quote::NullQuoteEngine;
pub use store::NullStore;
