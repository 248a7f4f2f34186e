//! The external TPM quote engine.
//!
//! The engine itself is outside this process. [`SubprocessQuoteEngine`]
//! runs the attestation binary once per verification and reads a JSON
//! result from its stdout.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use proxy_types::Tier;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::AttestError;

/// What a valid quote proves about the device that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestationResult {
    /// Public half of the device's attestation key.
    pub public_key: Vec<u8>,
    /// Highest tier the hardware qualifies for.
    pub tier: Tier,
}

#[async_trait]
pub trait QuoteEngine: Send + Sync {
    /// Verify a quote over an issued nonce.
    async fn verify_quote(&self, nonce: &[u8], quote: &[u8])
        -> Result<AttestationResult, AttestError>;

    /// Verify a quote that signs an arbitrary message (tier-3 heartbeats).
    async fn verify_signed(
        &self,
        message: &[u8],
        quote: &[u8],
    ) -> Result<AttestationResult, AttestError>;
}

#[derive(Deserialize)]
struct EngineOutput {
    public_key: String,
    tier: u8,
}

/// Runs `<bin> verify-quote --nonce <hex> --quote <hex>` and
/// `<bin> verify-signed --message <hex> --quote <hex>`.
pub struct SubprocessQuoteEngine {
    bin_path: PathBuf,
}

impl SubprocessQuoteEngine {
    pub fn new(bin_path: impl Into<PathBuf>) -> Self {
        Self {
            bin_path: bin_path.into(),
        }
    }

    async fn run(&self, args: [&str; 5]) -> Result<AttestationResult, AttestError> {
        let output = Command::new(&self.bin_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                AttestError::Unavailable(format!("{}: {e}", self.bin_path.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(status = ?output.status.code(), stderr = %stderr.trim(), "quote rejected");
            return Err(AttestError::QuoteInvalid(stderr.trim().to_string()));
        }

        let parsed: EngineOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| AttestError::QuoteInvalid(format!("engine output: {e}")))?;
        let public_key = hex::decode(parsed.public_key.trim())
            .map_err(|e| AttestError::QuoteInvalid(format!("engine public key: {e}")))?;
        let tier = Tier::new(parsed.tier)
            .ok_or_else(|| AttestError::QuoteInvalid(format!("engine tier {}", parsed.tier)))?;
        Ok(AttestationResult { public_key, tier })
    }
}

#[async_trait]
impl QuoteEngine for SubprocessQuoteEngine {
    async fn verify_quote(
        &self,
        nonce: &[u8],
        quote: &[u8],
    ) -> Result<AttestationResult, AttestError> {
        let nonce = hex::encode(nonce);
        let quote = hex::encode(quote);
        self.run(["verify-quote", "--nonce", &nonce, "--quote", &quote])
            .await
    }

    async fn verify_signed(
        &self,
        message: &[u8],
        quote: &[u8],
    ) -> Result<AttestationResult, AttestError> {
        let message = hex::encode(message);
        let quote = hex::encode(quote);
        self.run(["verify-signed", "--message", &message, "--quote", &quote])
            .await
    }
}
