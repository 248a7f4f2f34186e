//! HMAC-SHA256 heartbeat signatures.
//!
//! Each node signs `"<node_id hex>:<unix seconds>"` with its own random key,
//! issued when it registers. The root key only signs the registration
//! heartbeat of a not-yet-enrolled node.

use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use proxy_types::{NodeId, Timestamp};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::random::random_bytes;

type HmacSha256 = Hmac<Sha256>;

/// Length of a heartbeat signature in bytes.
pub const HEARTBEAT_SIG_LEN: usize = 32;

/// A 32-byte HMAC key, wiped on drop.
#[derive(Clone)]
pub struct HeartbeatKey(Zeroizing<[u8; 32]>);

impl HeartbeatKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// A fresh key from the OS CSPRNG.
    pub fn random() -> Result<Self, CryptoError> {
        random_bytes::<32>().map(Self::new)
    }

    /// Parse a hex-encoded 32-byte key (the `ROOT_HMAC_KEY` format).
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        );
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for HeartbeatKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HeartbeatKey(..)")
    }
}

fn mac_for(key: &HeartbeatKey) -> HmacSha256 {
    // HMAC zero-pads keys shorter than the 64-byte SHA-256 block.
    let mut block = Zeroizing::new([0u8; 64]);
    block[..32].copy_from_slice(key.as_bytes());
    <HmacSha256 as KeyInit>::new(Key::<HmacSha256>::from_slice(&block[..]))
}

/// The exact bytes a heartbeat signature covers.
pub fn heartbeat_message(node_id: &NodeId, timestamp: Timestamp) -> Vec<u8> {
    format!("{}:{}", node_id.to_hex(), timestamp.as_secs()).into_bytes()
}

pub fn sign_heartbeat(
    key: &HeartbeatKey,
    node_id: &NodeId,
    timestamp: Timestamp,
) -> [u8; HEARTBEAT_SIG_LEN] {
    let mut mac = mac_for(key);
    mac.update(&heartbeat_message(node_id, timestamp));
    mac.finalize().into_bytes().into()
}

/// Constant-time check of a heartbeat signature.
pub fn verify_heartbeat(
    key: &HeartbeatKey,
    node_id: &NodeId,
    timestamp: Timestamp,
    signature: &[u8],
) -> bool {
    let mut mac = mac_for(key);
    mac.update(&heartbeat_message(node_id, timestamp));
    mac.verify_slice(signature).is_ok()
}
