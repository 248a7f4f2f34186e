//! Request and response payloads of the API facade.
//!
//! Binary fields travel as lowercase hex. Responses are also what the
//! idempotency cache stores, so every one of them round-trips through
//! JSON.

use serde::{Deserialize, Serialize};

use proxy_types::{
    Decision, Geofence, InvoiceId, Node, NodeId, NodeStatus, Nonce, PhysicalTask, Sats,
    StatTotals, TaskId, TaskStateKind, Telemetry, Tier, Timestamp, VerifierId,
};

// ── Tasks ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostTaskRequest {
    pub principal_agent_id: String,
    pub task_type: String,
    pub bid_amount_sats: Sats,
    pub required_tier: Tier,
    #[serde(default)]
    pub geofence: Option<Geofence>,
    /// Opaque encrypted payload.
    #[serde(default, with = "proxy_types::serde_hex")]
    pub metadata: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTaskResponse {
    pub task_id: TaskId,
    pub escrow_invoice_id: InvoiceId,
    pub state: TaskStateKind,
}

/// An assigned node attesting the nonce its next step is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedStep {
    pub task_id: TaskId,
    pub node_id: NodeId,
    #[serde(with = "proxy_types::serde_hex")]
    pub attestation_quote: Vec<u8>,
}

/// A node turning down an offer, or backing out of a matched task. The
/// quote covers the offer nonce while the task is open and the challenge
/// nonce once it is matched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclineTaskRequest {
    pub task_id: TaskId,
    pub node_id: NodeId,
    #[serde(with = "proxy_types::serde_hex")]
    pub attestation_quote: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitProofRequest {
    pub task_id: TaskId,
    pub node_id: NodeId,
    #[serde(with = "proxy_types::serde_hex")]
    pub proof_blob: Vec<u8>,
    #[serde(with = "proxy_types::serde_hex")]
    pub attestation_quote: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyCallbackRequest {
    pub task_id: TaskId,
    pub decision: Decision,
    pub verifier_id: VerifierId,
    /// Ed25519 over `task_id:decision:verifier_id`.
    #[serde(with = "proxy_types::serde_hex")]
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    pub task_id: TaskId,
}

/// Where a task stands after a lifecycle call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskStateKind,
    pub assigned_node_id: Option<NodeId>,
    /// Nonce the assigned node must attest for its next step.
    pub challenge_nonce: Option<Nonce>,
    pub deadline_at: Option<Timestamp>,
    pub version: u64,
}

impl From<&PhysicalTask> for TaskStatus {
    fn from(task: &PhysicalTask) -> Self {
        Self {
            task_id: task.task_id,
            state: task.state.kind(),
            assigned_node_id: task.assigned_node_id(),
            challenge_nonce: task.challenge_nonce,
            deadline_at: task.deadline_at,
            version: task.version,
        }
    }
}

// ── Nodes ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub node_id: NodeId,
    /// This heartbeat registered the node.
    pub registered: bool,
    pub uptime_credited: u64,
    pub status: NodeStatus,
    pub reputation: u32,
    /// The node's heartbeat HMAC key. Present only on the ack that
    /// registered the node.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "proxy_types::serde_hex::option"
    )]
    pub heartbeat_key: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueNonceRequest {
    pub node_id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceResponse {
    pub node_id: NodeId,
    pub nonce: Nonce,
    pub expires_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequest {
    pub node_id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStanding {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub reputation: u32,
}

/// The public face of a node. Key material and identity fingerprints stay
/// inside the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub tier: Tier,
    pub reputation: u32,
    pub status: NodeStatus,
    pub stake_sats: Sats,
    pub service_area: Option<Geofence>,
    pub registered_at: Timestamp,
    pub last_heartbeat_at: Timestamp,
    pub stale: bool,
    pub offline: bool,
    pub telemetry: Telemetry,
    /// Rolling 24-hour counters.
    pub stats: StatTotals,
}

impl NodeView {
    pub fn new(node: &Node, now: Timestamp) -> Self {
        Self {
            node_id: node.node_id,
            tier: node.tier,
            reputation: node.reputation,
            status: node.status,
            stake_sats: node.stake_sats,
            service_area: node.service_area,
            registered_at: node.registered_at,
            last_heartbeat_at: node.last_heartbeat_at,
            stale: node.stale,
            offline: node.offline,
            telemetry: node.telemetry.clone(),
            stats: node.rolling_stats.totals(now),
        }
    }
}

impl From<&Node> for NodeStanding {
    fn from(node: &Node) -> Self {
        Self {
            node_id: node.node_id,
            status: node.status,
            reputation: node.reputation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_task_wire_format() {
        let json = r#"{
            "principal_agent_id": "agent-7",
            "task_type": "courier",
            "bid_amount_sats": 1500,
            "required_tier": 2,
            "geofence": {"lat": 52.5, "lon": 13.4, "radius_m": 500.0},
            "metadata": "c0ffee"
        }"#;
        let req: PostTaskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.bid_amount_sats, Sats::new(1_500));
        assert_eq!(req.required_tier, Tier::SILVER);
        assert_eq!(req.metadata, vec![0xc0, 0xff, 0xee]);
    }

    #[test]
    fn geofence_and_metadata_are_optional() {
        let json = r#"{"principal_agent_id":"a","task_type":"t","bid_amount_sats":1,"required_tier":1,"geofence":null}"#;
        let req: PostTaskRequest = serde_json::from_str(json).unwrap();
        assert!(req.geofence.is_none());
        assert!(req.metadata.is_empty());
    }

    #[test]
    fn node_view_hides_key_material() {
        let mut node = Node::new(
            NodeId::new([1; 16]),
            proxy_types::Fingerprint::new([2; 16]),
            vec![3; 32],
            Tier::SILVER,
            500,
            NodeStatus::Active,
            Timestamp::new(1_000),
        );
        node.heartbeat_secret = proxy_types::HeartbeatSecret::new([4; 32]);
        let json = serde_json::to_value(NodeView::new(&node, Timestamp::new(1_000))).unwrap();
        let fields = json.as_object().unwrap();
        assert!(fields.contains_key("reputation"));
        for hidden in ["public_key", "pubkey_fingerprint", "heartbeat_secret"] {
            assert!(!fields.contains_key(hidden), "{hidden} leaked");
        }
        assert!(!json.to_string().contains(&"04".repeat(32)));
    }

    #[test]
    fn registration_ack_carries_the_key_once() {
        let ack = HeartbeatAck {
            node_id: NodeId::new([1; 16]),
            registered: false,
            uptime_credited: 5,
            status: NodeStatus::Active,
            reputation: 500,
            heartbeat_key: None,
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert!(json.get("heartbeat_key").is_none());

        let ack = HeartbeatAck {
            registered: true,
            heartbeat_key: Some(vec![0xab; 32]),
            ..ack
        };
        let json = serde_json::to_string(&ack).unwrap();
        let back: HeartbeatAck = serde_json::from_str(&json).unwrap();
        assert_eq!(back.heartbeat_key, Some(vec![0xab; 32]));
    }

    #[test]
    fn verdict_callback_wire_format() {
        let json = format!(
            r#"{{"task_id":"{}","decision":"RETRY","verifier_id":"v1","signature":"{}"}}"#,
            "0a".repeat(16),
            "11".repeat(64)
        );
        let req: VerifyCallbackRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req.decision, Decision::Retry);
        assert_eq!(req.signature.len(), 64);
    }
}
