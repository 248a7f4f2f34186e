//! The heartbeat envelope as it arrives on the wire.

use proxy_types::{Geofence, NodeId, Nonce, Sats, Telemetry, Tier, Timestamp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// First-heartbeat payload that registers a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Nonce previously obtained from `issue_nonce`.
    pub nonce: Nonce,
    /// TPM quote over `nonce`.
    #[serde(with = "proxy_types::serde_hex")]
    pub quote: Vec<u8>,
    pub declared_tier: Tier,
    #[serde(default)]
    pub stake_sats: Sats,
    #[serde(default)]
    pub service_area: Option<Geofence>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEnvelope {
    pub node_id: NodeId,
    /// Unix seconds, carried as a decimal string.
    #[serde(with = "timestamp_string")]
    pub timestamp: Timestamp,
    /// HMAC-SHA256 over `node_id:timestamp`. Empty when `tpm_quote` is used.
    #[serde(default, with = "proxy_types::serde_hex")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub telemetry: Telemetry,
    #[serde(default)]
    pub registration: Option<Registration>,
    /// Tier-3 only: TPM-signed quote over `node_id:timestamp`.
    #[serde(default, with = "proxy_types::serde_hex::option")]
    pub tpm_quote: Option<Vec<u8>>,
}

mod timestamp_string {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.as_secs().to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>()
            .map(Timestamp::new)
            .map_err(|e| serde::de::Error::custom(format!("timestamp '{s}': {e}")))
    }
}
