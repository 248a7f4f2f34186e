//! Candidate selection for OPEN tasks.
//!
//! Filters nodes by tier, tier bid cap, status, assignment, heartbeat
//! freshness, geofence and earlier offers, then ranks them by reputation
//! (descending), load (ascending) and `Blake2b(task_id || node_id)`.

use std::collections::HashSet;

use proxy_crypto::rank_key;
use proxy_types::{Node, NodeId, PhysicalTask, ProtocolParams, Timestamp};

pub struct Matcher {
    params: ProtocolParams,
}

impl Matcher {
    pub fn new(params: ProtocolParams) -> Self {
        Self { params }
    }

    /// Why `node` may not carry `task` right now, if it may not.
    ///
    /// Does not consider assignment or earlier offers; see
    /// [`Matcher::candidates`].
    pub fn check_eligible(&self, task: &PhysicalTask, node: &Node, now: Timestamp) -> Result<(), String> {
        if !node.status.is_matchable() {
            return Err(format!("node {} is {}", node.node_id, node.status));
        }
        if node.tier < task.required_tier {
            return Err(format!(
                "node tier {} is below the required {}",
                node.tier, task.required_tier
            ));
        }
        if !node.tier.can_carry_bid(task.bid_amount_sats.get(), &self.params) {
            return Err(format!(
                "bid of {} exceeds the cap of tier {}",
                task.bid_amount_sats, node.tier
            ));
        }
        if !node.heartbeat_fresh(now, self.params.heartbeat_stale_secs) {
            return Err(format!("node {} has no fresh heartbeat", node.node_id));
        }
        if let Some(area) = &task.geofence {
            let serves = node.service_area.as_ref().is_some_and(|s| s.serves(area));
            if !serves {
                return Err(format!("node {} does not serve the task area", node.node_id));
            }
        }
        Ok(())
    }

    /// Every eligible node not busy with another task and never offered
    /// this one, best first.
    pub fn candidates<'a>(
        &self,
        task: &PhysicalTask,
        nodes: &'a [Node],
        busy: &HashSet<NodeId>,
        now: Timestamp,
    ) -> Vec<&'a Node> {
        let offered: HashSet<&NodeId> = task.match_progress.offered.iter().collect();
        let mut ranked: Vec<(&Node, [u8; 32])> = nodes
            .iter()
            .filter(|n| !busy.contains(&n.node_id) && !offered.contains(&n.node_id))
            .filter(|n| self.check_eligible(task, n, now).is_ok())
            .map(|n| (n, rank_key(&task.task_id, &n.node_id)))
            .collect();
        ranked.sort_by(|(a, ka), (b, kb)| {
            b.reputation
                .cmp(&a.reputation)
                .then_with(|| a.telemetry.load.total_cmp(&b.telemetry.load))
                .then_with(|| ka.cmp(kb))
        });
        ranked.into_iter().map(|(n, _)| n).collect()
    }

    /// The next round's batch.
    pub fn next_round<'a>(
        &self,
        task: &PhysicalTask,
        nodes: &'a [Node],
        busy: &HashSet<NodeId>,
        now: Timestamp,
    ) -> Vec<&'a Node> {
        let mut batch = self.candidates(task, nodes, busy, now);
        batch.truncate(self.params.offer_batch_size);
        batch
    }
}
