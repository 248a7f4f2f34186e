//! Idempotency record storage.

use proxy_types::Timestamp;

use crate::StoreError;

/// Stored successful responses keyed by `(caller_id, request_id)`.
pub trait IdempotencyStore: Send + Sync {
    fn get_response(
        &self,
        caller_id: &str,
        request_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    fn put_response(
        &self,
        caller_id: &str,
        request_id: &str,
        response: &[u8],
        recorded_at: Timestamp,
    ) -> Result<(), StoreError>;

    /// Drop records written before `cutoff`. Returns how many were removed.
    fn purge_responses_before(&self, cutoff: Timestamp) -> Result<usize, StoreError>;
}

/// Composite key `caller_id || 0x00 || request_id`.
pub fn idempotency_key(caller_id: &str, request_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(caller_id.len() + request_id.len() + 1);
    key.extend_from_slice(caller_id.as_bytes());
    key.push(0);
    key.extend_from_slice(request_id.as_bytes());
    key
}
