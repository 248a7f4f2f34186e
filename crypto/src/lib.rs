//! Cryptographic primitives for the proxy network engine.
//!
//! - **HMAC-SHA256** for heartbeat envelopes, under a random per-node key
//! - **Blake2b** for node identities, key fingerprints and ranking tie-breaks
//! - **Ed25519** for verifier callback signatures
//! - OS randomness for nonces and task ids

pub mod error;
pub mod hash;
pub mod heartbeat;
pub mod random;
pub mod sign;

pub use error::CryptoError;
pub use hash::{
    blake2b_256, blake2b_256_multi, fingerprint_for_key, node_id_for_key, proof_ref, rank_key,
};
pub use heartbeat::{
    heartbeat_message, sign_heartbeat, verify_heartbeat, HeartbeatKey, HEARTBEAT_SIG_LEN,
};
pub use random::{random_bytes, random_nonce, RandomIds};
pub use sign::{
    generate_signing_key, sign_verdict, verdict_message, verify_verdict, verifying_key_from_hex,
};
