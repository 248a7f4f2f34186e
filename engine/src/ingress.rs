//! Heartbeat ingress and the missed-heartbeat sweep.
//!
//! An envelope is authenticated by the attestor first (signature, clock
//! skew, replay watermark), then admitted by the node's rate bucket, then
//! either registers the node or marks it seen. The sweep walks the
//! registry and flags, charges and eventually retires silent nodes.

use std::sync::Arc;

use proxy_attestation::{
    AttestError, Attestor, Enrollment, HeartbeatEnvelope, HeartbeatVerdict, Registration,
};
use proxy_crypto::{fingerprint_for_key, HeartbeatKey};
use proxy_reputation::ReputationEvent;
use proxy_types::{Clock, HeartbeatSecret, Node, NodeId, NodeStatus, ProtocolParams};

use crate::events::{EngineEvent, EventBus};
use crate::metrics::EngineMetrics;
use crate::rate_limit::RateBuckets;
use crate::registry::{sanitize_telemetry, NodeRegistry};
use crate::requests::HeartbeatAck;
use crate::EngineError;

/// Rate buckets idle this long are dropped by the sweep.
const BUCKET_IDLE_MS: u64 = 60_000;

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub missed_beats: usize,
    pub went_offline: usize,
    /// Miss intervals charged (a capped interval still counts).
    pub intervals_charged: usize,
    pub retired: usize,
}

#[derive(Default)]
struct SweepStep {
    missed_beat: bool,
    went_offline: bool,
    charged: usize,
}

pub struct HeartbeatIngress {
    attestor: Arc<dyn Attestor>,
    registry: Arc<NodeRegistry>,
    clock: Arc<dyn Clock>,
    buckets: RateBuckets,
    params: ProtocolParams,
    events: EventBus,
    metrics: Arc<EngineMetrics>,
}

impl HeartbeatIngress {
    pub fn new(
        attestor: Arc<dyn Attestor>,
        registry: Arc<NodeRegistry>,
        clock: Arc<dyn Clock>,
        params: ProtocolParams,
        events: EventBus,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            buckets: RateBuckets::new(params.heartbeat_min_interval_ms),
            attestor,
            registry,
            clock,
            params,
            events,
            metrics,
        }
    }

    /// Process one inbound heartbeat envelope.
    pub async fn handle(&self, envelope: &HeartbeatEnvelope) -> Result<HeartbeatAck, EngineError> {
        let result = self.process(envelope).await;
        match &result {
            Ok(_) => self.metrics.heartbeats_accepted.inc(),
            Err(e) => {
                tracing::debug!(node_id = %envelope.node_id, error = %e, "heartbeat rejected");
                self.metrics
                    .heartbeats_rejected
                    .with_label_values(&[e.kind().as_str()])
                    .inc();
            }
        }
        result
    }

    async fn process(&self, envelope: &HeartbeatEnvelope) -> Result<HeartbeatAck, EngineError> {
        let verdict = self.attestor.verify_heartbeat(envelope).await?;
        if !self
            .buckets
            .admit(&verdict.node_id, self.clock.now_millis())
        {
            return Err(EngineError::RateLimited(verdict.node_id));
        }

        if verdict.registering {
            let registration = envelope
                .registration
                .as_ref()
                .ok_or(EngineError::UnknownNode(verdict.node_id))?;
            return self.register(envelope, registration, &verdict).await;
        }

        let seen = self.registry.mark_seen(
            &verdict.node_id,
            verdict.timestamp,
            envelope.telemetry.clone(),
            self.params.uptime_credit_cap_secs,
        )?;
        if seen.was_offline {
            tracing::info!(node_id = %verdict.node_id, "node back online");
        }
        let node = self
            .registry
            .get(&verdict.node_id)
            .ok_or(EngineError::UnknownNode(verdict.node_id))?;
        Ok(HeartbeatAck {
            node_id: node.node_id,
            registered: false,
            uptime_credited: seen.uptime_credited,
            status: node.status,
            reputation: node.reputation,
            heartbeat_key: None,
        })
    }

    /// First heartbeat of a node: verify its quote and add it to the registry.
    async fn register(
        &self,
        envelope: &HeartbeatEnvelope,
        registration: &Registration,
        verdict: &HeartbeatVerdict,
    ) -> Result<HeartbeatAck, EngineError> {
        let node_id = verdict.node_id;
        if self.registry.contains(&node_id) {
            return Err(EngineError::NotEligible(format!(
                "node {node_id} is already known and cannot re-register"
            )));
        }
        if registration
            .service_area
            .as_ref()
            .is_some_and(|area| !area.is_valid())
        {
            return Err(EngineError::NotEligible("service area is out of range".into()));
        }

        let attested = self
            .attestor
            .verify_quote(&node_id, &registration.nonce, &registration.quote)
            .await?;
        if registration.declared_tier > attested.tier {
            return Err(EngineError::NotEligible(format!(
                "declared tier {} exceeds attested tier {}",
                registration.declared_tier, attested.tier
            )));
        }

        let key = HeartbeatKey::random().map_err(|e| AttestError::Unavailable(e.to_string()))?;
        let reputation = self.params.initial_reputation;
        let fingerprint = fingerprint_for_key(&attested.public_key);
        let mut node = Node::new(
            node_id,
            fingerprint,
            attested.public_key,
            registration.declared_tier,
            reputation,
            NodeStatus::for_reputation(reputation, &self.params),
            self.clock.now(),
        );
        node.last_heartbeat_at = verdict.timestamp;
        node.stake_sats = registration.stake_sats;
        node.service_area = registration.service_area;
        node.telemetry = sanitize_telemetry(envelope.telemetry.clone());
        node.heartbeat_secret = HeartbeatSecret::new(*key.as_bytes());
        let ack = HeartbeatAck {
            node_id,
            registered: true,
            uptime_credited: 0,
            status: node.status,
            reputation,
            heartbeat_key: Some(key.as_bytes().to_vec()),
        };
        let tier = node.tier;

        self.registry.register(node)?;
        self.attestor.enroll(Enrollment {
            node_id,
            key,
            fingerprint,
            tier,
            last_accepted: verdict.timestamp,
        });
        self.metrics.nodes_registered.inc();
        self.metrics
            .registered_nodes
            .set(self.registry.active_count() as i64);
        tracing::info!(node_id = %node_id, tier = %tier, "node registered");
        Ok(ack)
    }

    /// Flag stale and offline nodes, charge silence intervals, retire the
    /// long-silent.
    pub fn sweep(&self) -> Result<SweepReport, EngineError> {
        let now = self.clock.now();
        let p = &self.params;
        let reputation = self.registry.reputation();
        let mut report = SweepReport::default();

        for node in self.registry.snapshot_all() {
            if node.is_retired() {
                continue;
            }
            let node_id = node.node_id;
            let silence = node.last_heartbeat_at.elapsed_since(now);
            if silence > p.retire_after_secs {
                if self.registry.retire(&node_id)? {
                    self.attestor.forget(&node_id);
                    report.retired += 1;
                    tracing::info!(node_id = %node_id, silence_secs = silence, "node retired after prolonged silence");
                    self.events.emit(EngineEvent::NodeRetired { node_id });
                }
                continue;
            }
            if silence <= p.heartbeat_stale_secs {
                continue;
            }

            let step = self.registry.update(&node_id, |n| {
                let silence = n.last_heartbeat_at.elapsed_since(now);
                let mut step = SweepStep::default();
                if n.is_retired() || silence <= p.heartbeat_stale_secs {
                    return Ok(step);
                }
                if !n.stale {
                    n.stale = true;
                    step.missed_beat = true;
                }
                if silence >= p.offline_after_secs && !n.offline {
                    n.offline = true;
                    step.went_offline = true;
                }
                let due = u32::try_from(silence / p.miss_interval_secs.max(1)).unwrap_or(u32::MAX);
                while n.miss_ledger.charged_intervals < due {
                    reputation.apply(n, ReputationEvent::MissedInterval, now);
                    step.charged += 1;
                }
                Ok(step)
            })?;

            if step.missed_beat {
                report.missed_beats += 1;
                tracing::debug!(node_id = %node_id, silence_secs = silence, "missed heartbeat");
                self.events.emit(EngineEvent::MissedBeat {
                    node_id,
                    last_heartbeat_at: node.last_heartbeat_at,
                });
            }
            if step.went_offline {
                report.went_offline += 1;
                tracing::info!(node_id = %node_id, silence_secs = silence, "node offline");
                self.events.emit(EngineEvent::NodeOffline { node_id });
            }
            report.intervals_charged += step.charged;
        }

        self.buckets.prune(self.clock.now_millis(), BUCKET_IDLE_MS);
        self.metrics
            .registered_nodes
            .set(self.registry.active_count() as i64);
        Ok(report)
    }

    /// Operator retirement.
    pub fn retire(&self, node_id: &NodeId) -> Result<Node, EngineError> {
        if self.registry.retire(node_id)? {
            self.attestor.forget(node_id);
            tracing::info!(node_id = %node_id, "node retired by operator");
            self.events.emit(EngineEvent::NodeRetired { node_id: *node_id });
            self.metrics
                .registered_nodes
                .set(self.registry.active_count() as i64);
        }
        self.registry
            .get(node_id)
            .ok_or(EngineError::UnknownNode(*node_id))
    }
}
