//! Engine events for subscribers (transport push channels, monitors).

use serde::Serialize;
use tokio::sync::broadcast;

use proxy_types::{NodeId, Nonce, TaskId, TaskStateKind, Timestamp, VerifierId};

/// Something observers may want to react to.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A match round started; each node must attest its nonce to accept.
    TaskOffered {
        task_id: TaskId,
        offers: Vec<(NodeId, Nonce)>,
        window_ends_at: Timestamp,
    },
    /// A verifier is asked for a verdict on the task's proof.
    VerificationRequested {
        task_id: TaskId,
        verifier_id: VerifierId,
        #[serde(with = "hex_32")]
        proof_ref: [u8; 32],
    },
    TaskTransitioned {
        task_id: TaskId,
        from: Option<TaskStateKind>,
        to: TaskStateKind,
    },
    /// First sweep that found the node's heartbeat stale.
    MissedBeat {
        node_id: NodeId,
        last_heartbeat_at: Timestamp,
    },
    NodeOffline {
        node_id: NodeId,
    },
    NodeRetired {
        node_id: NodeId,
    },
}

mod hex_32 {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }
}

/// Fan-out event bus on a broadcast channel.
///
/// Emitting never blocks; a subscriber that falls more than `capacity`
/// events behind sees `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}
