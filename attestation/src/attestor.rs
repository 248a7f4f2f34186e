//! The attestor: nonce issuance, quote checks, heartbeat authentication.

use std::sync::Arc;

use async_trait::async_trait;
use proxy_crypto::{fingerprint_for_key, heartbeat_message, node_id_for_key, random_nonce, verify_heartbeat};
use proxy_types::{Clock, NodeId, Nonce, ProtocolParams, Tier, Timestamp};

use crate::envelope::HeartbeatEnvelope;
use crate::error::AttestError;
use crate::keyring::{Enrollment, KeyRing};
use crate::nonce::NonceCache;
use crate::quote::{AttestationResult, QuoteEngine};

/// An authenticated heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatVerdict {
    pub node_id: NodeId,
    pub timestamp: Timestamp,
    /// Signed with the root key by a node that is not enrolled yet; the
    /// envelope's registration payload still has to be verified.
    pub registering: bool,
}

#[async_trait]
pub trait Attestor: Send + Sync {
    /// A fresh single-use nonce bound to `node_id`, valid for the default
    /// TTL, on a caller's request. Each node id holds a limited number.
    fn issue_nonce(&self, node_id: &NodeId) -> Result<Nonce, AttestError>;

    /// An engine-issued challenge with an explicit lifetime. Not capped.
    fn issue_nonce_for(&self, node_id: &NodeId, ttl_secs: u64) -> Result<Nonce, AttestError>;

    /// Verify `quote` over `nonce`, then consume the nonce. The attested
    /// key must hash to `node_id`; a rejected quote leaves the nonce live.
    async fn verify_quote(
        &self,
        node_id: &NodeId,
        nonce: &Nonce,
        quote: &[u8],
    ) -> Result<AttestationResult, AttestError>;

    /// Authenticate a heartbeat: signature, clock skew, then replay.
    async fn verify_heartbeat(
        &self,
        envelope: &HeartbeatEnvelope,
    ) -> Result<HeartbeatVerdict, AttestError>;

    fn enroll(&self, enrollment: Enrollment);

    fn forget(&self, node_id: &NodeId);
}

/// Production attestor backed by a TPM [`QuoteEngine`].
pub struct TpmAttestor {
    keyring: KeyRing,
    nonces: NonceCache,
    engine: Arc<dyn QuoteEngine>,
    clock: Arc<dyn Clock>,
    clock_skew_secs: u64,
    nonce_ttl_secs: u64,
}

impl TpmAttestor {
    pub fn new(
        keyring: KeyRing,
        engine: Arc<dyn QuoteEngine>,
        clock: Arc<dyn Clock>,
        params: &ProtocolParams,
    ) -> Self {
        Self {
            keyring,
            nonces: NonceCache::new(params.max_nonces_per_node),
            engine,
            clock,
            clock_skew_secs: params.clock_skew_secs,
            nonce_ttl_secs: params.nonce_ttl_secs,
        }
    }

    pub fn outstanding_nonces(&self) -> usize {
        self.nonces.len()
    }

    fn check_skew(&self, now: Timestamp, ts: Timestamp) -> Result<(), AttestError> {
        let skew_secs = now.abs_diff(ts);
        if skew_secs > self.clock_skew_secs {
            return Err(AttestError::ClockSkew { skew_secs });
        }
        Ok(())
    }
}

#[async_trait]
impl Attestor for TpmAttestor {
    fn issue_nonce(&self, node_id: &NodeId) -> Result<Nonce, AttestError> {
        let now = self.clock.now();
        self.nonces.purge_expired(now);
        let nonce = random_nonce().map_err(|e| AttestError::Unavailable(e.to_string()))?;
        self.nonces
            .insert_requested(nonce, *node_id, now.plus(self.nonce_ttl_secs), now)?;
        Ok(nonce)
    }

    fn issue_nonce_for(&self, node_id: &NodeId, ttl_secs: u64) -> Result<Nonce, AttestError> {
        let now = self.clock.now();
        self.nonces.purge_expired(now);
        let nonce = random_nonce().map_err(|e| AttestError::Unavailable(e.to_string()))?;
        self.nonces.insert(nonce, *node_id, now.plus(ttl_secs));
        Ok(nonce)
    }

    async fn verify_quote(
        &self,
        node_id: &NodeId,
        nonce: &Nonce,
        quote: &[u8],
    ) -> Result<AttestationResult, AttestError> {
        self.nonces.check(node_id, nonce, self.clock.now())?;
        let result = self.engine.verify_quote(nonce.as_bytes(), quote).await?;
        if node_id_for_key(&result.public_key) != *node_id {
            tracing::warn!(node_id = %node_id, "quote attests a key of another node");
            return Err(AttestError::QuoteInvalid(
                "attested key does not belong to this node".into(),
            ));
        }
        // A concurrent verification may have used the nonce meanwhile.
        self.nonces.take(node_id, nonce, self.clock.now())?;
        Ok(result)
    }

    async fn verify_heartbeat(
        &self,
        envelope: &HeartbeatEnvelope,
    ) -> Result<HeartbeatVerdict, AttestError> {
        let node_id = envelope.node_id;
        let ts = envelope.timestamp;
        let message = heartbeat_message(&node_id, ts);

        match self.keyring.lookup(&node_id) {
            Some((key, fingerprint, tier)) => {
                if let Some(quote) = &envelope.tpm_quote {
                    if tier != Tier::GOLD {
                        return Err(AttestError::BadSignature(
                            "tpm-signed heartbeats require tier 3".into(),
                        ));
                    }
                    let result = self.engine.verify_signed(&message, quote).await?;
                    if fingerprint_for_key(&result.public_key) != fingerprint {
                        return Err(AttestError::BadSignature(
                            "heartbeat quote signed by another key".into(),
                        ));
                    }
                } else if !verify_heartbeat(&key, &node_id, ts, &envelope.signature) {
                    return Err(AttestError::BadSignature("hmac mismatch".into()));
                }
                self.check_skew(self.clock.now(), ts)?;
                self.keyring.accept_timestamp(&node_id, ts)?;
                Ok(HeartbeatVerdict {
                    node_id,
                    timestamp: ts,
                    registering: false,
                })
            }
            None => {
                if envelope.registration.is_none() {
                    return Err(AttestError::UnknownNode(node_id));
                }
                if !verify_heartbeat(self.keyring.root(), &node_id, ts, &envelope.signature) {
                    return Err(AttestError::BadSignature("hmac mismatch".into()));
                }
                self.check_skew(self.clock.now(), ts)?;
                Ok(HeartbeatVerdict {
                    node_id,
                    timestamp: ts,
                    registering: true,
                })
            }
        }
    }

    fn enroll(&self, enrollment: Enrollment) {
        tracing::debug!(node_id = %enrollment.node_id, tier = %enrollment.tier, "enrolled heartbeat key");
        self.keyring.enroll(enrollment);
    }

    fn forget(&self, node_id: &NodeId) {
        self.keyring.forget(node_id);
    }
}
