//! Protocol parameters: reputation scoring, liveness and SLA timings.
//!
//! Defaults reproduce the published protocol constants. Every field can be
//! overridden from the engine's TOML configuration.

use serde::{Deserialize, Serialize};

/// All tunable protocol constants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolParams {
    // ── Reputation ───────────────────────────────────────────────────────
    /// Score assigned to a freshly registered node.
    pub initial_reputation: u32,
    /// Upper clamp for reputation.
    pub max_reputation: u32,
    /// Scores strictly below this are SUSPENDED.
    pub suspend_below: u32,
    /// Scores strictly below this (and not suspended) are PROBATION.
    pub probation_below: u32,
    /// Score set by an operator re-certification.
    pub recertify_score: u32,
    /// Base reward for a verified completion.
    pub pass_base: u32,
    /// Bid sats per extra reputation point on a verified completion.
    pub pass_bid_divisor: u64,
    /// Maximum reward for a single verified completion.
    pub pass_cap: u32,
    /// Penalty for a FAIL verdict.
    pub fail_penalty: u32,
    /// Penalty for missing the execution deadline.
    pub flake_penalty: u32,
    /// Penalty for declining (or timing out) after a match.
    pub decline_penalty: u32,
    /// Penalty per continuous silence interval.
    pub miss_penalty: u32,
    /// Length of one silence interval, seconds.
    pub miss_interval_secs: u64,
    /// Maximum total miss penalty per rolling 24 hours.
    pub miss_penalty_cap_per_day: u32,

    // ── Liveness ─────────────────────────────────────────────────────────
    /// A heartbeat older than this makes the node stale.
    pub heartbeat_stale_secs: u64,
    /// Continuous silence after which the node is flagged offline.
    pub offline_after_secs: u64,
    /// Silence after which the node is retired.
    pub retire_after_secs: u64,
    /// Maximum uptime credited between two consecutive heartbeats.
    pub uptime_credit_cap_secs: u64,
    /// Maximum accepted |now - heartbeat timestamp|.
    pub clock_skew_secs: u64,
    /// Lifetime of an issued attestation nonce.
    pub nonce_ttl_secs: u64,
    /// Unexpired nonces one node id may hold from `issue_nonce` at a time.
    pub max_nonces_per_node: usize,
    /// Minimum spacing between accepted heartbeats of one node, milliseconds.
    pub heartbeat_min_interval_ms: u64,
    /// Period of the missed-heartbeat sweep.
    pub sweep_interval_secs: u64,

    // ── Task lifecycle ───────────────────────────────────────────────────
    /// An OPEN task that is not matched within this window is cancelled.
    pub task_ttl_secs: u64,
    /// A MATCHED task must be started within this window.
    pub match_timeout_secs: u64,
    /// Execution deadline for task types without their own policy.
    pub default_deadline_secs: u64,
    /// Time a verifier has to return a verdict.
    pub verification_window_secs: u64,
    /// Time each offer round stays open.
    pub offer_window_secs: u64,
    /// Candidates offered per round.
    pub offer_batch_size: usize,
    /// Rounds before an unmatched task is cancelled.
    pub max_offer_rounds: u8,
    /// RETRY verdicts tolerated per task.
    pub max_verification_retries: u8,
    /// Escrow hold expiry beyond the task's latest possible deadline.
    pub escrow_expiry_margin_secs: u64,

    // ── Tier bid caps ────────────────────────────────────────────────────
    /// Largest bid assignable to a tier-1 (Bronze) node.
    pub bronze_max_bid_sats: u64,
    /// Largest bid assignable to a tier-2 (Silver) node.
    pub silver_max_bid_sats: u64,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            initial_reputation: 500,
            max_reputation: 1000,
            suspend_below: 300,
            probation_below: 500,
            recertify_score: 400,
            pass_base: 10,
            pass_bid_divisor: 10_000,
            pass_cap: 50,
            fail_penalty: 50,
            flake_penalty: 20,
            decline_penalty: 5,
            miss_penalty: 2,
            miss_interval_secs: 600,
            miss_penalty_cap_per_day: 10,

            heartbeat_stale_secs: 120,
            offline_after_secs: 600,
            retire_after_secs: 7 * 86_400,
            uptime_credit_cap_secs: 90,
            clock_skew_secs: 120,
            nonce_ttl_secs: 300,
            max_nonces_per_node: 4,
            heartbeat_min_interval_ms: 1_000,
            sweep_interval_secs: 30,

            task_ttl_secs: 3_600,
            match_timeout_secs: 300,
            default_deadline_secs: 4 * 3_600,
            verification_window_secs: 3_600,
            offer_window_secs: 30,
            offer_batch_size: 5,
            max_offer_rounds: 3,
            max_verification_retries: 1,
            escrow_expiry_margin_secs: 3_600,

            bronze_max_bid_sats: 499,
            silver_max_bid_sats: 1_500,
        }
    }
}

impl ProtocolParams {
    /// Latest moment, relative to posting, at which a task can still settle:
    /// TTL for matching, the start window, the longest execution deadline,
    /// one verification retry and the verification window.
    pub fn max_task_lifetime_secs(&self, execution_deadline_secs: u64) -> u64 {
        let retries = u64::from(self.max_verification_retries) + 1;
        self.task_ttl_secs
            .saturating_add(self.match_timeout_secs)
            .saturating_add(
                execution_deadline_secs
                    .saturating_add(self.verification_window_secs)
                    .saturating_mul(retries),
            )
    }
}
