//! The operator node model and its rolling counters.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::amount::Sats;
use crate::geo::Geofence;
use crate::ids::{Fingerprint, NodeId};
use crate::state::{NodeStatus, Tier};
use crate::time::Timestamp;

const HOUR_SECS: u64 = 3_600;
const DAY_SECS: u64 = 86_400;
const WINDOW_HOURS: u64 = 24;

/// Self-reported node telemetry carried by each heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Free-form operator status string ("ok", "busy", ...).
    pub status: String,
    /// Current load, 0.0 (idle) to 1.0 (saturated).
    pub load: f64,
    /// Uptime reported by the node agent, seconds.
    pub uptime: u64,
}

/// Counters for one hour of the rolling window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StatBucket {
    hour: u64,
    tasks_completed: u32,
    tasks_missed: u32,
    uptime_seconds: u64,
}

/// Totals over the last 24 hours.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatTotals {
    pub tasks_completed: u32,
    pub tasks_missed: u32,
    pub uptime_seconds: u64,
}

/// Hourly-bucketed counters covering a sliding 24-hour window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingStats {
    buckets: VecDeque<StatBucket>,
}

impl RollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completed(&mut self, now: Timestamp) {
        self.bucket_mut(now).tasks_completed += 1;
    }

    pub fn record_missed(&mut self, now: Timestamp) {
        self.bucket_mut(now).tasks_missed += 1;
    }

    pub fn add_uptime(&mut self, now: Timestamp, secs: u64) {
        if secs > 0 {
            let bucket = self.bucket_mut(now);
            bucket.uptime_seconds = bucket.uptime_seconds.saturating_add(secs);
        }
    }

    /// Sum of every bucket still inside the window at `now`.
    pub fn totals(&self, now: Timestamp) -> StatTotals {
        let oldest = Self::oldest_hour(now);
        self.buckets
            .iter()
            .filter(|b| b.hour >= oldest)
            .fold(StatTotals::default(), |mut acc, b| {
                acc.tasks_completed += b.tasks_completed;
                acc.tasks_missed += b.tasks_missed;
                acc.uptime_seconds = acc.uptime_seconds.saturating_add(b.uptime_seconds);
                acc
            })
    }

    fn oldest_hour(now: Timestamp) -> u64 {
        (now.as_secs() / HOUR_SECS).saturating_sub(WINDOW_HOURS - 1)
    }

    fn bucket_mut(&mut self, now: Timestamp) -> &mut StatBucket {
        let hour = now.as_secs() / HOUR_SECS;
        let oldest = Self::oldest_hour(now);
        while self.buckets.front().is_some_and(|b| b.hour < oldest) {
            self.buckets.pop_front();
        }
        if self.buckets.back().map_or(true, |b| b.hour < hour) {
            self.buckets.push_back(StatBucket {
                hour,
                ..StatBucket::default()
            });
        }
        // A clock that went backwards lands in the newest bucket.
        let last = self.buckets.len() - 1;
        &mut self.buckets[last]
    }
}

/// Bookkeeping for heartbeat-miss penalties.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissLedger {
    /// Silence intervals already charged since the last heartbeat.
    pub charged_intervals: u32,
    /// Penalties applied, with the time they were applied.
    penalties: VecDeque<(Timestamp, u32)>,
}

impl MissLedger {
    /// Total miss penalty applied during the 24 hours before `now`.
    pub fn charged_in_window(&self, now: Timestamp) -> u32 {
        self.penalties
            .iter()
            .filter(|(at, _)| at.elapsed_since(now) < DAY_SECS)
            .map(|(_, amount)| amount)
            .sum()
    }

    pub fn record(&mut self, now: Timestamp, amount: u32) {
        while self
            .penalties
            .front()
            .is_some_and(|(at, _)| at.elapsed_since(now) >= DAY_SECS)
        {
            self.penalties.pop_front();
        }
        if amount > 0 {
            self.penalties.push_back((now, amount));
        }
    }

    /// A heartbeat ended the silence.
    pub fn reset_silence(&mut self) {
        self.charged_intervals = 0;
    }
}

/// A node's heartbeat HMAC key. Issued at random when the node registers
/// and handed to it exactly once.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSecret([u8; 32]);

impl HeartbeatSecret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_issued(&self) -> bool {
        self.0 != [0; 32]
    }
}

impl std::fmt::Debug for HeartbeatSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HeartbeatSecret(..)")
    }
}

/// A human-operated endpoint that executes physical tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub pubkey_fingerprint: Fingerprint,
    /// Attested public key, as reported by the TPM engine.
    pub public_key: Vec<u8>,
    pub tier: Tier,
    pub reputation: u32,
    pub status: NodeStatus,
    pub stake_sats: Sats,
    /// Area the operator declared it can serve.
    pub service_area: Option<Geofence>,
    pub registered_at: Timestamp,
    pub last_heartbeat_at: Timestamp,
    /// Heartbeat older than the stale threshold.
    pub stale: bool,
    /// Silent for longer than the offline threshold. Sub-state of `status`.
    pub offline: bool,
    pub telemetry: Telemetry,
    pub rolling_stats: RollingStats,
    pub miss_ledger: MissLedger,
    /// Never leaves the engine except in the registration ack.
    pub heartbeat_secret: HeartbeatSecret,
}

impl Node {
    /// A freshly registered node at the initial reputation.
    pub fn new(
        node_id: NodeId,
        pubkey_fingerprint: Fingerprint,
        public_key: Vec<u8>,
        tier: Tier,
        initial_reputation: u32,
        status: NodeStatus,
        now: Timestamp,
    ) -> Self {
        Self {
            node_id,
            pubkey_fingerprint,
            public_key,
            tier,
            reputation: initial_reputation,
            status,
            stake_sats: Sats::ZERO,
            service_area: None,
            registered_at: now,
            last_heartbeat_at: now,
            stale: false,
            offline: false,
            telemetry: Telemetry::default(),
            rolling_stats: RollingStats::new(),
            miss_ledger: MissLedger::default(),
            heartbeat_secret: HeartbeatSecret::default(),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.status == NodeStatus::Retired
    }

    /// Whether the last heartbeat is younger than `stale_secs`.
    pub fn heartbeat_fresh(&self, now: Timestamp, stale_secs: u64) -> bool {
        !self.offline && self.last_heartbeat_at.elapsed_since(now) < stale_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_stats_drop_old_hours() {
        let mut stats = RollingStats::new();
        let t0 = Timestamp::new(10 * HOUR_SECS);
        stats.record_completed(t0);
        stats.add_uptime(t0, 60);
        stats.record_missed(t0.plus(HOUR_SECS));

        let totals = stats.totals(t0.plus(2 * HOUR_SECS));
        assert_eq!(totals.tasks_completed, 1);
        assert_eq!(totals.tasks_missed, 1);
        assert_eq!(totals.uptime_seconds, 60);

        let later = t0.plus(24 * HOUR_SECS);
        let totals = stats.totals(later);
        assert_eq!(totals.tasks_completed, 0);
        assert_eq!(totals.tasks_missed, 1);
    }

    #[test]
    fn rolling_stats_merge_within_hour() {
        let mut stats = RollingStats::new();
        let t0 = Timestamp::new(5 * HOUR_SECS);
        stats.add_uptime(t0, 30);
        stats.add_uptime(t0.plus(100), 30);
        assert_eq!(stats.buckets.len(), 1);
        assert_eq!(stats.totals(t0.plus(100)).uptime_seconds, 60);
    }

    #[test]
    fn rolling_stats_tolerate_clock_going_back() {
        let mut stats = RollingStats::new();
        stats.record_completed(Timestamp::new(10 * HOUR_SECS));
        stats.record_completed(Timestamp::new(9 * HOUR_SECS));
        assert_eq!(stats.totals(Timestamp::new(10 * HOUR_SECS)).tasks_completed, 2);
    }

    #[test]
    fn heartbeat_secret_is_redacted() {
        let secret = HeartbeatSecret::new([0xAB; 32]);
        assert!(secret.is_issued());
        assert!(!HeartbeatSecret::default().is_issued());
        assert_eq!(format!("{secret:?}"), "HeartbeatSecret(..)");
    }

    #[test]
    fn miss_ledger_window() {
        let mut ledger = MissLedger::default();
        let t0 = Timestamp::new(1_000_000);
        ledger.record(t0, 2);
        ledger.record(t0.plus(600), 2);
        assert_eq!(ledger.charged_in_window(t0.plus(600)), 4);
        assert_eq!(ledger.charged_in_window(t0.plus(DAY_SECS + 1)), 2);
        ledger.record(t0.plus(2 * DAY_SECS), 0);
        assert_eq!(ledger.charged_in_window(t0.plus(2 * DAY_SECS)), 0);
    }

    #[test]
    fn heartbeat_freshness() {
        let mut node = Node::new(
            NodeId::new([1; 16]),
            Fingerprint::new([2; 16]),
            vec![3; 32],
            Tier::SILVER,
            500,
            NodeStatus::Active,
            Timestamp::new(1_000),
        );
        assert!(node.heartbeat_fresh(Timestamp::new(1_119), 120));
        assert!(!node.heartbeat_fresh(Timestamp::new(1_120), 120));
        node.offline = true;
        assert!(!node.heartbeat_fresh(Timestamp::new(1_001), 120));
    }
}
