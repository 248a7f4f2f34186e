//! Nullable TPM quote engine.
//!
//! A "quote" is `challenge || tier || public_key`. The engine accepts it
//! when the challenge matches; no hardware or subprocess is involved.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use proxy_attestation::{AttestError, AttestationResult, QuoteEngine};
use proxy_types::Tier;

#[derive(Default)]
pub struct NullQuoteEngine {
    offline: AtomicBool,
}

impl NullQuoteEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Build a quote this engine accepts.
    pub fn quote(challenge: &[u8], tier: Tier, public_key: &[u8]) -> Vec<u8> {
        let mut quote = challenge.to_vec();
        quote.push(tier.level());
        quote.extend_from_slice(public_key);
        quote
    }

    fn check(&self, challenge: &[u8], quote: &[u8]) -> Result<AttestationResult, AttestError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AttestError::Unavailable("null quote engine offline".into()));
        }
        let rest = quote
            .strip_prefix(challenge)
            .ok_or_else(|| AttestError::QuoteInvalid("challenge mismatch".into()))?;
        let (&level, public_key) = rest
            .split_first()
            .ok_or_else(|| AttestError::QuoteInvalid("truncated quote".into()))?;
        let tier =
            Tier::new(level).ok_or_else(|| AttestError::QuoteInvalid(format!("tier {level}")))?;
        if public_key.is_empty() {
            return Err(AttestError::QuoteInvalid("missing public key".into()));
        }
        Ok(AttestationResult {
            public_key: public_key.to_vec(),
            tier,
        })
    }
}

#[async_trait]
impl QuoteEngine for NullQuoteEngine {
    async fn verify_quote(
        &self,
        nonce: &[u8],
        quote: &[u8],
    ) -> Result<AttestationResult, AttestError> {
        self.check(nonce, quote)
    }

    async fn verify_signed(
        &self,
        message: &[u8],
        quote: &[u8],
    ) -> Result<AttestationResult, AttestError> {
        self.check(message, quote)
    }
}
