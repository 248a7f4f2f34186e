//! Outstanding attestation challenges.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use proxy_types::{NodeId, Nonce, Timestamp};

use crate::error::AttestError;

#[derive(Clone, Copy)]
struct Entry {
    node_id: NodeId,
    expires_at: Timestamp,
    /// Asked for by the caller rather than issued by the engine itself.
    requested: bool,
}

/// Single-use nonces, each bound to one node and an expiry.
pub struct NonceCache {
    entries: Mutex<HashMap<Nonce, Entry>>,
    max_requested_per_node: usize,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl NonceCache {
    /// A cache allowing each node id `max_requested_per_node` outstanding
    /// requested nonces. Engine-issued nonces are not counted.
    pub fn new(max_requested_per_node: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_requested_per_node,
        }
    }

    /// An engine-issued challenge (offer, start or proof nonce).
    pub fn insert(&self, nonce: Nonce, node_id: NodeId, expires_at: Timestamp) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                nonce,
                Entry {
                    node_id,
                    expires_at,
                    requested: false,
                },
            );
    }

    /// A nonce a caller asked for on behalf of `node_id`. Fails with
    /// `TooManyNonces` while the node already holds the maximum.
    pub fn insert_requested(
        &self,
        nonce: Nonce,
        node_id: NodeId,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> Result<(), AttestError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let held = entries
            .values()
            .filter(|e| e.requested && e.node_id == node_id && now < e.expires_at)
            .count();
        if held >= self.max_requested_per_node {
            return Err(AttestError::TooManyNonces(node_id));
        }
        entries.insert(
            nonce,
            Entry {
                node_id,
                expires_at,
                requested: true,
            },
        );
        Ok(())
    }

    /// Check that `nonce` is live and bound to `node_id` without using it
    /// up. An expired nonce is dropped.
    pub fn check(&self, node_id: &NodeId, nonce: &Nonce, now: Timestamp) -> Result<(), AttestError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(nonce) {
            Some(e) if e.node_id != *node_id => Err(AttestError::UnknownNode(*node_id)),
            None => Err(AttestError::UnknownNode(*node_id)),
            Some(e) if now >= e.expires_at => {
                entries.remove(nonce);
                Err(AttestError::NonceExpired)
            }
            Some(_) => Ok(()),
        }
    }

    /// Consume `nonce` for `node_id`. A nonce bound to the node is removed
    /// on first use, whether or not it was still valid.
    pub fn take(&self, node_id: &NodeId, nonce: &Nonce, now: Timestamp) -> Result<(), AttestError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(nonce) {
            Some(e) if e.node_id != *node_id => Err(AttestError::UnknownNode(*node_id)),
            None => Err(AttestError::UnknownNode(*node_id)),
            Some(e) => {
                let expired = now >= e.expires_at;
                entries.remove(nonce);
                if expired {
                    Err(AttestError::NonceExpired)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Drop every nonce that expired at or before `now`.
    pub fn purge_expired(&self, now: Timestamp) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| now < e.expires_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
