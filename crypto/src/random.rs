//! OS randomness: nonces, keys and the production id source.

use std::sync::atomic::{AtomicU64, Ordering};

use proxy_types::{IdSource, Nonce, TaskId};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::hash::blake2b_256_multi;

/// Fill an `N`-byte array from the operating system's CSPRNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|e| CryptoError::Rng(e.to_string()))?;
    Ok(buf)
}

/// A fresh 128-bit attestation challenge.
pub fn random_nonce() -> Result<Nonce, CryptoError> {
    random_bytes::<16>().map(Nonce::new)
}

/// Production [`IdSource`].
///
/// Task ids are Blake2b(secret seed || counter), so they are unpredictable
/// to callers and never repeat within a process. Journal sequence numbers
/// continue from the highest one already persisted.
pub struct RandomIds {
    seed: Zeroizing<[u8; 32]>,
    counter: AtomicU64,
    journal_seq: AtomicU64,
}

impl RandomIds {
    pub fn new(last_journal_seq: u64) -> Result<Self, CryptoError> {
        Ok(Self {
            seed: Zeroizing::new(random_bytes::<32>()?),
            counter: AtomicU64::new(0),
            journal_seq: AtomicU64::new(last_journal_seq),
        })
    }
}

impl IdSource for RandomIds {
    fn next_task_id(&self) -> TaskId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = blake2b_256_multi(&[&self.seed[..], &n.to_le_bytes()]);
        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        TaskId::new(id)
    }

    fn next_journal_seq(&self) -> u64 {
        self.journal_seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}
