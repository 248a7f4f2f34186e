//! Per-node heartbeat keys and replay watermarks.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use proxy_crypto::HeartbeatKey;
use proxy_types::{Fingerprint, NodeId, Tier, Timestamp};

use crate::error::AttestError;

/// What the attestor needs to know about a registered node.
#[derive(Clone, Debug)]
pub struct Enrollment {
    pub node_id: NodeId,
    /// The node's own heartbeat key, issued at registration.
    pub key: HeartbeatKey,
    pub fingerprint: Fingerprint,
    pub tier: Tier,
    /// Timestamp of the newest heartbeat already accepted.
    pub last_accepted: Timestamp,
}

struct KeyEntry {
    key: HeartbeatKey,
    fingerprint: Fingerprint,
    tier: Tier,
    last_accepted: Timestamp,
}

/// Heartbeat keys of enrolled nodes, plus the bootstrap root key.
pub struct KeyRing {
    root: HeartbeatKey,
    entries: Mutex<HashMap<NodeId, KeyEntry>>,
}

impl KeyRing {
    pub fn new(root: HeartbeatKey) -> Self {
        Self {
            root,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &HeartbeatKey {
        &self.root
    }

    pub fn enroll(&self, enrollment: Enrollment) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                enrollment.node_id,
                KeyEntry {
                    key: enrollment.key,
                    fingerprint: enrollment.fingerprint,
                    tier: enrollment.tier,
                    last_accepted: enrollment.last_accepted,
                },
            );
    }

    pub fn forget(&self, node_id: &NodeId) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id);
    }

    pub fn is_enrolled(&self, node_id: &NodeId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(node_id)
    }

    /// Heartbeat key, fingerprint and tier of an enrolled node.
    pub fn lookup(&self, node_id: &NodeId) -> Option<(HeartbeatKey, Fingerprint, Tier)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .map(|e| (e.key.clone(), e.fingerprint, e.tier))
    }

    /// Advance the node's replay watermark to `ts`, or fail with `Stale`
    /// when `ts` is not strictly newer.
    pub fn accept_timestamp(&self, node_id: &NodeId, ts: Timestamp) -> Result<(), AttestError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(node_id)
            .ok_or(AttestError::UnknownNode(*node_id))?;
        if ts <= entry.last_accepted {
            return Err(AttestError::Stale {
                last: entry.last_accepted,
                got: ts,
            });
        }
        entry.last_accepted = ts;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> KeyRing {
        KeyRing::new(HeartbeatKey::new([5; 32]))
    }

    fn enrollment(last: u64) -> Enrollment {
        Enrollment {
            node_id: NodeId::new([1; 16]),
            key: HeartbeatKey::new([6; 32]),
            fingerprint: Fingerprint::new([2; 16]),
            tier: Tier::SILVER,
            last_accepted: Timestamp::new(last),
        }
    }

    #[test]
    fn watermark_is_strict() {
        let ring = ring();
        ring.enroll(enrollment(100));
        let id = NodeId::new([1; 16]);
        assert!(matches!(
            ring.accept_timestamp(&id, Timestamp::new(100)),
            Err(AttestError::Stale { .. })
        ));
        assert!(ring.accept_timestamp(&id, Timestamp::new(101)).is_ok());
        assert!(ring.accept_timestamp(&id, Timestamp::new(101)).is_err());
    }

    #[test]
    fn enrolled_key_is_the_issued_one() {
        let ring = ring();
        ring.enroll(enrollment(0));
        let (key, fp, tier) = ring.lookup(&NodeId::new([1; 16])).unwrap();
        assert_eq!(fp, Fingerprint::new([2; 16]));
        assert_eq!(tier, Tier::SILVER);
        assert_eq!(key.as_bytes(), &[6; 32]);
        assert_ne!(key.as_bytes(), ring.root().as_bytes());
        ring.forget(&NodeId::new([1; 16]));
        assert!(!ring.is_enrolled(&NodeId::new([1; 16])));
    }
}
