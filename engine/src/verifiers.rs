//! Configured verifiers and per-task verifier selection.

use std::collections::BTreeMap;

use ed25519_dalek::VerifyingKey;
use proxy_crypto::{blake2b_256_multi, verifying_key_from_hex};
use proxy_types::{TaskId, VerifierId};

use crate::EngineError;

/// Verifier ids and their Ed25519 public keys.
pub struct VerifierPool {
    keys: BTreeMap<VerifierId, VerifyingKey>,
}

impl VerifierPool {
    pub fn new(keys: BTreeMap<VerifierId, VerifyingKey>) -> Self {
        Self { keys }
    }

    /// Build the pool from `id -> hex public key` config entries.
    pub fn from_config(entries: &BTreeMap<String, String>) -> Result<Self, EngineError> {
        let mut keys = BTreeMap::new();
        for (id, hex_key) in entries {
            let key = verifying_key_from_hex(hex_key)
                .map_err(|e| EngineError::Config(format!("verifier '{id}': {e}")))?;
            keys.insert(VerifierId::new(id.clone()), key);
        }
        Ok(Self { keys })
    }

    pub fn key(&self, verifier_id: &VerifierId) -> Option<&VerifyingKey> {
        self.keys.get(verifier_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The verifier for `task_id` that is not in `exclude`.
    ///
    /// Verifiers are ordered by `Blake2b(task_id || verifier_id)`, so the
    /// choice is deterministic per task and spreads load across the pool.
    pub fn select(&self, task_id: &TaskId, exclude: &[VerifierId]) -> Option<VerifierId> {
        self.keys
            .keys()
            .filter(|id| !exclude.contains(id))
            .min_by_key(|id| blake2b_256_multi(&[task_id.as_bytes(), id.as_str().as_bytes()]))
            .cloned()
    }
}
