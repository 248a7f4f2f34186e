//! Ed25519 signatures over verifier verdicts.
//!
//! A verifier signs `"<task_id hex>:<DECISION>:<verifier_id>"` with the key
//! whose public half is configured for it in the verifier pool.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use proxy_types::{Decision, TaskId, VerifierId};

use crate::error::CryptoError;
use crate::random::random_bytes;

/// The exact bytes a verdict signature covers.
pub fn verdict_message(task_id: &TaskId, decision: Decision, verifier_id: &VerifierId) -> Vec<u8> {
    format!("{}:{}:{}", task_id.to_hex(), decision.as_str(), verifier_id).into_bytes()
}

/// Generate a new Ed25519 signing key from OS randomness.
pub fn generate_signing_key() -> Result<SigningKey, CryptoError> {
    let seed = zeroize::Zeroizing::new(random_bytes::<32>()?);
    Ok(SigningKey::from_bytes(&seed))
}

/// Parse a hex-encoded 32-byte Ed25519 public key.
pub fn verifying_key_from_hex(s: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

pub fn sign_verdict(
    key: &SigningKey,
    task_id: &TaskId,
    decision: Decision,
    verifier_id: &VerifierId,
) -> [u8; 64] {
    key.sign(&verdict_message(task_id, decision, verifier_id))
        .to_bytes()
}

/// Verify a verdict signature. Malformed signatures simply fail.
pub fn verify_verdict(
    key: &VerifyingKey,
    task_id: &TaskId,
    decision: Decision,
    verifier_id: &VerifierId,
    signature: &[u8],
) -> bool {
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(&verdict_message(task_id, decision, verifier_id), &sig)
        .is_ok()
}
