//! The node registry: persistent node records behind per-node locks.
//!
//! Every mutation of one node runs inside that node's mutex on a working
//! copy, is written through to the store, and only then replaces the
//! cached record. Cross-node reads clone each record under its own lock,
//! so no operation ever holds two node locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use proxy_reputation::{ReputationChange, ReputationEngine, ReputationEvent};
use proxy_store::Store;
use proxy_types::{Node, NodeId, NodeStatus, Telemetry, Timestamp};

use crate::EngineError;

/// Result of crediting one heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeenUpdate {
    /// Uptime seconds added to the rolling window.
    pub uptime_credited: u64,
    pub was_offline: bool,
}

pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<Mutex<Node>>>>,
    store: Arc<dyn Store>,
    reputation: ReputationEngine,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn Store>, reputation: ReputationEngine) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            store,
            reputation,
        }
    }

    pub fn reputation(&self) -> &ReputationEngine {
        &self.reputation
    }

    /// Warm the cache from the store. Returns the number of nodes loaded.
    pub fn load(&self) -> Result<usize, EngineError> {
        let loaded = self.store.iter_nodes()?;
        let count = loaded.len();
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        for node in loaded {
            nodes.insert(node.node_id, Arc::new(Mutex::new(node)));
        }
        Ok(count)
    }

    /// Add a freshly attested node. Fails if the id is already known,
    /// retired identities included.
    pub fn register(&self, node: Node) -> Result<(), EngineError> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = nodes.get(&node.node_id) {
            let retired = existing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_retired();
            return Err(EngineError::NotEligible(if retired {
                format!("node {} is retired and cannot re-register", node.node_id)
            } else {
                format!("node {} is already registered", node.node_id)
            }));
        }
        self.store.put_node(&node)?;
        nodes.insert(node.node_id, Arc::new(Mutex::new(node)));
        Ok(())
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Node> {
        let slot = self.slot(node_id)?;
        let node = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(node.clone())
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(node_id)
    }

    /// Run `f` on a working copy of the node; persist and publish the copy
    /// only if `f` succeeds and changed something.
    pub fn update<R>(
        &self,
        node_id: &NodeId,
        f: impl FnOnce(&mut Node) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let slot = self
            .slot(node_id)
            .ok_or(EngineError::UnknownNode(*node_id))?;
        let mut current = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = current.clone();
        let out = f(&mut next)?;
        if next != *current {
            self.store.put_node(&next)?;
            *current = next;
        }
        Ok(out)
    }

    /// Apply a reputation event; the new status is stamped with the score.
    pub fn update_reputation(
        &self,
        node_id: &NodeId,
        event: ReputationEvent,
        now: Timestamp,
    ) -> Result<ReputationChange, EngineError> {
        self.update(node_id, |node| {
            let change = self.reputation.apply(node, event, now);
            match event {
                ReputationEvent::Pass { .. } => node.rolling_stats.record_completed(now),
                ReputationEvent::Flake => node.rolling_stats.record_missed(now),
                _ => {}
            }
            Ok(change)
        })
    }

    /// Record an accepted heartbeat at `ts`.
    ///
    /// Uptime credit is the gap since the previous heartbeat, clamped to
    /// `[0, credit_cap_secs]`.
    pub fn mark_seen(
        &self,
        node_id: &NodeId,
        ts: Timestamp,
        telemetry: Telemetry,
        credit_cap_secs: u64,
    ) -> Result<SeenUpdate, EngineError> {
        self.update(node_id, |node| {
            if node.is_retired() {
                return Err(EngineError::UnknownNode(*node_id));
            }
            let credit = node
                .last_heartbeat_at
                .elapsed_since(ts)
                .min(credit_cap_secs);
            let was_offline = node.offline;
            node.last_heartbeat_at = node.last_heartbeat_at.max(ts);
            node.stale = false;
            node.offline = false;
            node.miss_ledger.reset_silence();
            node.telemetry = sanitize_telemetry(telemetry);
            node.rolling_stats.add_uptime(ts, credit);
            Ok(SeenUpdate {
                uptime_credited: credit,
                was_offline,
            })
        })
    }

    /// Retire a node. Returns `false` if it already was.
    pub fn retire(&self, node_id: &NodeId) -> Result<bool, EngineError> {
        self.update(node_id, |node| {
            if node.is_retired() {
                return Ok(false);
            }
            node.status = NodeStatus::Retired;
            Ok(true)
        })
    }

    /// Operator re-certification of a SUSPENDED node.
    pub fn recertify(
        &self,
        node_id: &NodeId,
        now: Timestamp,
    ) -> Result<ReputationChange, EngineError> {
        self.update(node_id, |node| {
            if node.status != NodeStatus::Suspended {
                return Err(EngineError::NotEligible(format!(
                    "node {node_id} is {}, only SUSPENDED nodes are re-certified",
                    node.status
                )));
            }
            Ok(self.reputation.apply(node, ReputationEvent::Recertify, now))
        })
    }

    /// Cloned snapshot of every node, taken one lock at a time.
    pub fn snapshot_all(&self) -> Vec<Node> {
        let slots: Vec<_> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }

    /// Nodes that are not retired.
    pub fn active_count(&self) -> usize {
        self.snapshot_all()
            .iter()
            .filter(|n| !n.is_retired())
            .count()
    }

    fn slot(&self, node_id: &NodeId) -> Option<Arc<Mutex<Node>>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }
}

/// Clamp self-reported load to `[0, 1]`; non-finite values read as idle.
pub(crate) fn sanitize_telemetry(telemetry: Telemetry) -> Telemetry {
    let load = if telemetry.load.is_finite() {
        telemetry.load.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Telemetry { load, ..telemetry }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_nullables::NullStore;
    use proxy_store::NodeStore;
    use proxy_types::{Fingerprint, ProtocolParams, Sats, Tier};

    fn registry() -> (NodeRegistry, Arc<NullStore>) {
        let store = Arc::new(NullStore::new());
        let reg = NodeRegistry::new(
            store.clone(),
            ReputationEngine::new(ProtocolParams::default()),
        );
        (reg, store)
    }

    fn node(b: u8, rep: u32) -> Node {
        Node::new(
            NodeId::new([b; 16]),
            Fingerprint::new([b; 16]),
            vec![b; 32],
            Tier::SILVER,
            rep,
            NodeStatus::for_reputation(rep, &ProtocolParams::default()),
            Timestamp::new(1_000),
        )
    }

    #[test]
    fn register_writes_through() {
        let (reg, store) = registry();
        reg.register(node(1, 500)).unwrap();
        assert!(store.get_node(&NodeId::new([1; 16])).unwrap().is_some());
        assert!(matches!(
            reg.register(node(1, 500)),
            Err(EngineError::NotEligible(_))
        ));
    }

    #[test]
    fn reputation_and_status_move_together() {
        let (reg, store) = registry();
        let id = NodeId::new([1; 16]);
        reg.register(node(1, 500)).unwrap();
        let change = reg
            .update_reputation(&id, ReputationEvent::Fail, Timestamp::new(2_000))
            .unwrap();
        assert_eq!(change.after, 450);
        let stored = store.get_node(&id).unwrap().unwrap();
        assert_eq!(stored.reputation, 450);
        assert_eq!(stored.status, NodeStatus::Probation);
    }

    #[test]
    fn uptime_credit_is_clamped() {
        let (reg, _) = registry();
        let id = NodeId::new([1; 16]);
        reg.register(node(1, 500)).unwrap();
        let seen = reg
            .mark_seen(&id, Timestamp::new(1_030), Telemetry::default(), 90)
            .unwrap();
        assert_eq!(seen.uptime_credited, 30);
        let seen = reg
            .mark_seen(&id, Timestamp::new(1_500), Telemetry::default(), 90)
            .unwrap();
        assert_eq!(seen.uptime_credited, 90);
        let totals = reg
            .get(&id)
            .unwrap()
            .rolling_stats
            .totals(Timestamp::new(1_500));
        assert_eq!(totals.uptime_seconds, 120);
    }

    #[test]
    fn retired_nodes_stay_retired() {
        let (reg, _) = registry();
        let id = NodeId::new([1; 16]);
        reg.register(node(1, 500)).unwrap();
        assert!(reg.retire(&id).unwrap());
        assert!(!reg.retire(&id).unwrap());
        assert!(matches!(
            reg.mark_seen(&id, Timestamp::new(1_010), Telemetry::default(), 90),
            Err(EngineError::UnknownNode(_))
        ));
        let err = reg.register(node(1, 500)).unwrap_err();
        assert!(err.to_string().contains("retired"));
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn recertify_only_suspended() {
        let (reg, _) = registry();
        reg.register(node(1, 250)).unwrap();
        reg.register(node(2, 700)).unwrap();
        let change = reg
            .recertify(&NodeId::new([1; 16]), Timestamp::new(2_000))
            .unwrap();
        assert_eq!(change.after, 400);
        assert_eq!(change.status_after, NodeStatus::Probation);
        assert!(reg
            .recertify(&NodeId::new([2; 16]), Timestamp::new(2_000))
            .is_err());
    }

    #[test]
    fn failed_update_changes_nothing() {
        let (reg, _) = registry();
        let id = NodeId::new([1; 16]);
        reg.register(node(1, 500)).unwrap();
        let res: Result<(), _> = reg.update(&id, |n| {
            n.stake_sats = Sats::new(9);
            Err(EngineError::NotEligible("no".into()))
        });
        assert!(res.is_err());
        assert_eq!(reg.get(&id).unwrap().stake_sats, Sats::ZERO);
    }

    #[test]
    fn load_restores_from_store() {
        let (reg, store) = registry();
        reg.register(node(1, 500)).unwrap();
        let fresh = NodeRegistry::new(store, ReputationEngine::new(ProtocolParams::default()));
        assert_eq!(fresh.load().unwrap(), 1);
        assert!(fresh.contains(&NodeId::new([1; 16])));
    }
}
