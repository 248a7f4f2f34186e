//! Identifier types for nodes, tasks, nonces, invoices and verifiers.
//!
//! Fixed-width identifiers are 16 bytes and travel as lowercase hex on the
//! wire (`node_id: hex16`). Invoice and verifier ids are opaque strings owned
//! by external systems.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Failure to parse a hex identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseIdError {
    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

macro_rules! fixed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 16]);

        impl $name {
            pub const ZERO: Self = Self([0u8; 16]);

            pub fn new(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, ParseIdError> {
                let bytes = hex::decode(s).map_err(|e| ParseIdError::Hex(e.to_string()))?;
                let arr: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
                    ParseIdError::Length {
                        expected: 16,
                        actual: bytes.len(),
                    }
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..4]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_id!(
    /// Stable 128-bit node identity, derived from the attestation key's public half.
    NodeId
);

fixed_id!(
    /// Unique task identifier, assigned at creation.
    TaskId
);

fixed_id!(
    /// 128-bit attestation challenge.
    Nonce
);

fixed_id!(
    /// 16-byte hash of a node's attested public key; seeds its heartbeat key.
    Fingerprint
);

/// Opaque handle into the escrow backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(String);

impl InvoiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an external verifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerifierId(String);

impl VerifierId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VerifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of fresh identifiers.
pub trait IdSource: Send + Sync {
    /// A new, never-before-issued task id.
    fn next_task_id(&self) -> TaskId;

    /// A new journal sequence number, strictly greater than every earlier one.
    fn next_journal_seq(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_hex_round_trip() {
        let id = NodeId::new([0xAB; 16]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = TaskId::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            ParseIdError::Length {
                expected: 16,
                actual: 2
            }
        );
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!(matches!(NodeId::from_hex("zz"), Err(ParseIdError::Hex(_))));
    }

    #[test]
    fn ids_serialize_as_hex_strings() {
        let id = NodeId::new([1; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(16)));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn debug_is_abbreviated() {
        let id = Nonce::new([0xFF; 16]);
        assert_eq!(format!("{id:?}"), "Nonce(ffffffff)");
    }
}
