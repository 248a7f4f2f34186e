use proxy_types::{Node, NodeStatus, ProtocolParams, Timestamp};

use crate::event::ReputationEvent;

/// The outcome of applying one event to one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReputationChange {
    pub before: u32,
    pub after: u32,
    pub status_before: NodeStatus,
    pub status_after: NodeStatus,
}

impl ReputationChange {
    pub fn delta(&self) -> i64 {
        i64::from(self.after) - i64::from(self.before)
    }

    pub fn status_changed(&self) -> bool {
        self.status_before != self.status_after
    }
}

#[derive(Clone, Debug)]
pub struct ReputationEngine {
    params: ProtocolParams,
}

impl ReputationEngine {
    pub fn new(params: ProtocolParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    /// Nominal score delta of `event`, before clamping and miss caps.
    pub fn delta_for(&self, event: ReputationEvent) -> i64 {
        let p = &self.params;
        match event {
            ReputationEvent::Pass { bid } => {
                let bonus = bid.get() / p.pass_bid_divisor.max(1);
                let reward = u64::from(p.pass_base).saturating_add(bonus);
                reward.min(u64::from(p.pass_cap)) as i64
            }
            ReputationEvent::Fail => -i64::from(p.fail_penalty),
            ReputationEvent::Flake => -i64::from(p.flake_penalty),
            ReputationEvent::Declined => -i64::from(p.decline_penalty),
            ReputationEvent::MissedInterval => -i64::from(p.miss_penalty),
            ReputationEvent::Recertify => 0,
        }
    }

    /// Status a node with `reputation` must have. RETIRED never changes.
    pub fn status_for(&self, reputation: u32, current: NodeStatus) -> NodeStatus {
        if current == NodeStatus::Retired {
            return NodeStatus::Retired;
        }
        NodeStatus::for_reputation(reputation, &self.params)
    }

    /// Apply `event` to `node`, stamping the new score and status together.
    pub fn apply(&self, node: &mut Node, event: ReputationEvent, now: Timestamp) -> ReputationChange {
        let before = node.reputation;
        let status_before = node.status;
        if node.is_retired() {
            return ReputationChange {
                before,
                after: before,
                status_before,
                status_after: status_before,
            };
        }

        let after = match event {
            ReputationEvent::Recertify => self.params.recertify_score,
            ReputationEvent::MissedInterval => {
                node.miss_ledger.charged_intervals += 1;
                let already = node.miss_ledger.charged_in_window(now);
                let room = self.params.miss_penalty_cap_per_day.saturating_sub(already);
                let amount = self.params.miss_penalty.min(room);
                node.miss_ledger.record(now, amount);
                self.shift(before, status_before, -i64::from(amount))
            }
            other => self.shift(before, status_before, self.delta_for(other)),
        };

        node.reputation = after;
        node.status = self.status_for(after, status_before);
        let change = ReputationChange {
            before,
            after,
            status_before,
            status_after: node.status,
        };
        if change.status_changed() {
            tracing::info!(
                node_id = %node.node_id,
                event = %event,
                from = %status_before,
                to = %node.status,
                reputation = after,
                "node status changed"
            );
        } else {
            tracing::debug!(node_id = %node.node_id, event = %event, before, after, "reputation updated");
        }
        change
    }

    fn shift(&self, score: u32, status: NodeStatus, delta: i64) -> u32 {
        let max = i64::from(self.params.max_reputation);
        let mut next = (i64::from(score) + delta).clamp(0, max);
        if status == NodeStatus::Suspended && delta > 0 {
            let ceiling = i64::from(self.params.suspend_below.saturating_sub(1));
            next = next.min(ceiling.max(i64::from(score)));
        }
        next as u32
    }
}
