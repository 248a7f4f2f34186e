//! LMDB implementation of IdempotencyStore.

use proxy_store::idempotency::idempotency_key;
use proxy_store::{IdempotencyStore, StoreError};
use proxy_types::Timestamp;

use crate::{decode, encode, LmdbEnvironment, LmdbError};

impl IdempotencyStore for LmdbEnvironment {
    fn get_response(
        &self,
        caller_id: &str,
        request_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let key = idempotency_key(caller_id, request_id);
        match self
            .idempotency_db
            .get(&rtxn, &key)
            .map_err(LmdbError::from)?
        {
            Some(bytes) => {
                let (_, response): (Timestamp, Vec<u8>) = decode(bytes)?;
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }

    fn put_response(
        &self,
        caller_id: &str,
        request_id: &str,
        response: &[u8],
        recorded_at: Timestamp,
    ) -> Result<(), StoreError> {
        let bytes = encode(&(recorded_at, response))?;
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.idempotency_db
            .put(&mut wtxn, &idempotency_key(caller_id, request_id), &bytes)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn purge_responses_before(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.idempotency_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut to_delete = Vec::new();
        for entry in iter {
            let (key, val) = entry.map_err(LmdbError::from)?;
            let (at, _): (Timestamp, Vec<u8>) = decode(val)?;
            if at < cutoff {
                to_delete.push(key.to_vec());
            }
        }
        drop(rtxn);

        let count = to_delete.len();
        if !to_delete.is_empty() {
            let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
            for key in &to_delete {
                self.idempotency_db
                    .delete(&mut wtxn, key)
                    .map_err(LmdbError::from)?;
            }
            wtxn.commit().map_err(LmdbError::from)?;
        }
        Ok(count)
    }
}
