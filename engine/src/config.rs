//! Engine configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use proxy_escrow::RetryPolicy;
use proxy_types::{ProtocolParams, Tier};

use crate::EngineError;

/// Per-task-type policy: minimum tier and execution deadline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskTypePolicy {
    #[serde(default = "default_min_tier")]
    pub min_tier: Tier,
    /// Execution deadline in seconds; the protocol default when absent.
    #[serde(default)]
    pub deadline_s: Option<u64>,
}

/// Configuration for the engine.
///
/// Can be loaded from a TOML file via [`EngineConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data directory for the LMDB environment.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// LMDB map size in bytes.
    #[serde(default = "default_map_size")]
    pub map_size: usize,

    /// Base URL of the hold-invoice escrow backend.
    #[serde(default = "default_escrow_url")]
    pub escrow_backend_url: String,

    /// Per-request timeout for escrow calls, milliseconds.
    #[serde(default = "default_escrow_timeout_ms")]
    pub escrow_timeout_ms: u64,

    /// Path of the TPM attestation binary.
    #[serde(default = "default_attestor_bin")]
    pub attestor_bin_path: PathBuf,

    /// Root HMAC key (hex, 32 bytes). Only used to bootstrap node keys.
    #[serde(default, skip_serializing)]
    pub root_hmac_key: Option<String>,

    /// Period of the deadline tick, milliseconds.
    #[serde(default = "default_tick_ms")]
    pub deadline_tick_ms: u64,

    /// Caller ids allowed to run operator operations.
    #[serde(default)]
    pub operators: Vec<String>,

    /// How long idempotent responses are kept, seconds.
    #[serde(default = "default_idempotency_retention")]
    pub idempotency_retention_secs: u64,

    /// RPC listen port.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether the RPC server exposes `/metrics`.
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Abort the process when an internal invariant breaks. Tests turn
    /// this off and get the error instead.
    #[serde(default = "default_true")]
    pub abort_on_invariant_violation: bool,

    // Tables last, so the TOML rendering stays valid.
    #[serde(default)]
    pub escrow_retry: RetryPolicy,

    /// Scoring, liveness and SLA constants.
    #[serde(default)]
    pub params: ProtocolParams,

    /// Policy by task type name.
    #[serde(default)]
    pub task_types: BTreeMap<String, TaskTypePolicy>,

    /// Verifier id -> Ed25519 public key (hex).
    #[serde(default)]
    pub verifiers: BTreeMap<String, String>,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_min_tier() -> Tier {
    Tier::BRONZE
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./proxy_data")
}

fn default_map_size() -> usize {
    1 << 30
}

fn default_escrow_url() -> String {
    "http://127.0.0.1:8090".to_string()
}

fn default_escrow_timeout_ms() -> u64 {
    10_000
}

fn default_attestor_bin() -> PathBuf {
    PathBuf::from("proxy-attestor")
}

fn default_tick_ms() -> u64 {
    1_000
}

fn default_idempotency_retention() -> u64 {
    86_400
}

fn default_rpc_port() -> u16 {
    7080
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

// ── Impl ───────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Serialize the configuration (without the root key) to TOML.
    pub fn to_toml_string(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Minimum tier and execution deadline for `task_type`.
    pub fn policy_for(&self, task_type: &str) -> (Tier, u64) {
        match self.task_types.get(task_type) {
            Some(policy) => (
                policy.min_tier,
                policy
                    .deadline_s
                    .unwrap_or(self.params.default_deadline_secs),
            ),
            None => (Tier::BRONZE, self.params.default_deadline_secs),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.deadline_tick_ms == 0 {
            return Err(EngineError::Config("deadline_tick_ms must be positive".into()));
        }
        if self.params.heartbeat_stale_secs == 0 {
            return Err(EngineError::Config("heartbeat_stale_secs must be positive".into()));
        }
        if self.params.max_nonces_per_node == 0 {
            return Err(EngineError::Config("max_nonces_per_node must be positive".into()));
        }
        if self.params.offer_batch_size == 0 || self.params.max_offer_rounds == 0 {
            return Err(EngineError::Config(
                "offer_batch_size and max_offer_rounds must be positive".into(),
            ));
        }
        if self.params.suspend_below > self.params.probation_below
            || self.params.probation_below > self.params.max_reputation
        {
            return Err(EngineError::Config("reputation thresholds are out of order".into()));
        }
        for (name, policy) in &self.task_types {
            if policy.deadline_s == Some(0) {
                return Err(EngineError::Config(format!(
                    "task type '{name}' has a zero deadline"
                )));
            }
        }
        for (id, key) in &self.verifiers {
            proxy_crypto::verifying_key_from_hex(key)
                .map_err(|e| EngineError::Config(format!("verifier '{id}': {e}")))?;
        }
        if let Some(key) = &self.root_hmac_key {
            proxy_crypto::HeartbeatKey::from_hex(key)
                .map_err(|e| EngineError::Config(format!("root_hmac_key: {e}")))?;
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            map_size: default_map_size(),
            escrow_backend_url: default_escrow_url(),
            escrow_timeout_ms: default_escrow_timeout_ms(),
            escrow_retry: RetryPolicy::default(),
            attestor_bin_path: default_attestor_bin(),
            root_hmac_key: None,
            deadline_tick_ms: default_tick_ms(),
            params: ProtocolParams::default(),
            task_types: BTreeMap::new(),
            verifiers: BTreeMap::new(),
            operators: Vec::new(),
            idempotency_retention_secs: default_idempotency_retention(),
            rpc_port: default_rpc_port(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            enable_metrics: true,
            abort_on_invariant_violation: true,
        }
    }
}
