//! A simulated node device: TPM identity plus heartbeat signing.

use std::sync::{Arc, Mutex};

use proxy_attestation::{HeartbeatEnvelope, Registration};
use proxy_crypto::{
    fingerprint_for_key, heartbeat_message, node_id_for_key, sign_heartbeat, HeartbeatKey,
};
use proxy_types::{Fingerprint, Geofence, NodeId, Nonce, Sats, Telemetry, Tier, Timestamp};

use crate::quote::NullQuoteEngine;

/// Everything a test needs to act as one physical node.
#[derive(Clone, Debug)]
pub struct NullDevice {
    pub public_key: Vec<u8>,
    /// Tier the hardware attests to.
    pub tier: Tier,
    pub service_area: Option<Geofence>,
    root: [u8; 32],
    /// Heartbeat key handed out at registration. Clones share it.
    key: Arc<Mutex<Option<HeartbeatKey>>>,
}

impl NullDevice {
    /// A device whose public key is 32 copies of `seed`.
    pub fn new(seed: u8, tier: Tier, root: [u8; 32]) -> Self {
        Self {
            public_key: vec![seed; 32],
            tier,
            service_area: None,
            root,
            key: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_service_area(mut self, area: Geofence) -> Self {
        self.service_area = Some(area);
        self
    }

    pub fn node_id(&self) -> NodeId {
        node_id_for_key(&self.public_key)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_for_key(&self.public_key)
    }

    /// Keep the heartbeat key from a registration ack.
    pub fn learn_key(&self, key: &[u8]) {
        let key: [u8; 32] = key.try_into().expect("32-byte heartbeat key");
        *self.key.lock().unwrap() = Some(HeartbeatKey::new(key));
    }

    /// The learned heartbeat key; the root key before registration.
    pub fn heartbeat_key(&self) -> HeartbeatKey {
        self.key
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| HeartbeatKey::new(self.root))
    }

    /// A TPM quote over `nonce`.
    pub fn quote(&self, nonce: &Nonce) -> Vec<u8> {
        NullQuoteEngine::quote(nonce.as_bytes(), self.tier, &self.public_key)
    }

    /// A first heartbeat, signed with the root key, registering at `declared_tier`.
    pub fn registration(
        &self,
        nonce: &Nonce,
        declared_tier: Tier,
        timestamp: Timestamp,
    ) -> HeartbeatEnvelope {
        let node_id = self.node_id();
        HeartbeatEnvelope {
            node_id,
            timestamp,
            signature: sign_heartbeat(&HeartbeatKey::new(self.root), &node_id, timestamp).to_vec(),
            telemetry: Telemetry::default(),
            registration: Some(Registration {
                nonce: *nonce,
                quote: self.quote(nonce),
                declared_tier,
                stake_sats: Sats::ZERO,
                service_area: self.service_area,
            }),
            tpm_quote: None,
        }
    }

    /// A regular heartbeat under the node's heartbeat key.
    pub fn heartbeat(&self, timestamp: Timestamp) -> HeartbeatEnvelope {
        let node_id = self.node_id();
        HeartbeatEnvelope {
            node_id,
            timestamp,
            signature: sign_heartbeat(&self.heartbeat_key(), &node_id, timestamp).to_vec(),
            telemetry: Telemetry {
                status: "ok".into(),
                load: 0.0,
                uptime: 0,
            },
            registration: None,
            tpm_quote: None,
        }
    }

    /// A tier-3 heartbeat carrying a TPM-signed quote instead of an HMAC.
    pub fn tpm_heartbeat(&self, timestamp: Timestamp) -> HeartbeatEnvelope {
        let node_id = self.node_id();
        let message = heartbeat_message(&node_id, timestamp);
        HeartbeatEnvelope {
            node_id,
            timestamp,
            signature: Vec::new(),
            telemetry: Telemetry::default(),
            registration: None,
            tpm_quote: Some(NullQuoteEngine::quote(&message, self.tier, &self.public_key)),
        }
    }
}
