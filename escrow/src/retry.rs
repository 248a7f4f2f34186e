//! Exponential backoff around escrow calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EscrowError;

/// Backoff schedule for retryable escrow failures.
///
/// Attempt `n` (0-based) that fails waits `initial_delay * 2^n`, capped at
/// `max_delay`, before attempt `n + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 5_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the failed attempt `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `on_retry` is told about every retry.
    pub async fn run<T, F, Fut>(
        &self,
        name: &str,
        mut op: F,
        mut on_retry: impl FnMut(u32, &EscrowError),
    ) -> Result<T, EscrowError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EscrowError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        op = name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "escrow call failed, retrying"
                    );
                    on_retry(attempt + 1, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_and_cap() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_after(0), Duration::from_millis(50));
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
        assert_eq!(p.delay_after(10), Duration::from_millis(5_000));
        assert_eq!(p.delay_after(200), Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let result = RetryPolicy::default()
            .run(
                "settle",
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EscrowError::BackendUnavailable("down".into()))
                    } else {
                        Ok(7)
                    }
                },
                |n, _| retries.push(n),
            )
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run(
                "cancel",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(EscrowError::BackendUnavailable("down".into()))
                },
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(EscrowError::BackendUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let invoice = proxy_types::InvoiceId::new("inv");
        let result: Result<(), _> = RetryPolicy::default()
            .run(
                "settle",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(EscrowError::AlreadyTerminal(invoice.clone()))
                },
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(EscrowError::AlreadyTerminal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
