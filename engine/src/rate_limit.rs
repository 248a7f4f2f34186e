//! Per-node heartbeat admission: one envelope per interval.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use proxy_types::NodeId;

/// Single-token bucket per node, refilled after `min_interval_ms`.
pub struct RateBuckets {
    min_interval_ms: u64,
    last: Mutex<HashMap<NodeId, u64>>,
}

impl RateBuckets {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Take the node's token at `now_ms`. Returns `false` if the previous
    /// admission was less than the interval ago.
    pub fn admit(&self, node_id: &NodeId, now_ms: u64) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match last.get(node_id) {
            Some(&prev) if now_ms.saturating_sub(prev) < self.min_interval_ms => false,
            _ => {
                last.insert(*node_id, now_ms);
                true
            }
        }
    }

    /// Drop buckets idle for longer than `idle_ms`.
    pub fn prune(&self, now_ms: u64, idle_ms: u64) {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, prev| now_ms.saturating_sub(*prev) < idle_ms);
    }

    pub fn len(&self) -> usize {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_per_second() {
        let buckets = RateBuckets::new(1_000);
        let a = NodeId::new([1; 16]);
        let b = NodeId::new([2; 16]);
        assert!(buckets.admit(&a, 10_000));
        assert!(!buckets.admit(&a, 10_999));
        assert!(buckets.admit(&b, 10_999));
        assert!(buckets.admit(&a, 11_000));
    }

    #[test]
    fn rejected_attempts_do_not_consume_the_token() {
        let buckets = RateBuckets::new(1_000);
        let a = NodeId::new([1; 16]);
        assert!(buckets.admit(&a, 0));
        assert!(!buckets.admit(&a, 500));
        assert!(buckets.admit(&a, 1_000));
    }

    #[test]
    fn prune_idle() {
        let buckets = RateBuckets::new(1_000);
        buckets.admit(&NodeId::new([1; 16]), 0);
        buckets.admit(&NodeId::new([2; 16]), 50_000);
        buckets.prune(60_000, 30_000);
        assert_eq!(buckets.len(), 1);
    }
}
