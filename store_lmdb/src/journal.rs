//! LMDB implementation of JournalStore.

use proxy_store::{JournalEntry, JournalStore, MetaStore, StoreError};

use crate::{decode, encode, LmdbEnvironment, LmdbError};

const LAST_SEQ_KEY: &str = "journal_last_seq";

impl JournalStore for LmdbEnvironment {
    fn put_entry(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let bytes = encode(entry)?;
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.journal_db
            .put(&mut wtxn, &entry.seq.to_be_bytes(), &bytes)
            .map_err(LmdbError::from)?;
        // The high-water mark lives beside the entry so both commit together.
        let last = self
            .meta_db
            .get(&wtxn, LAST_SEQ_KEY.as_bytes())
            .map_err(LmdbError::from)?
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0);
        if entry.seq > last {
            self.meta_db
                .put(&mut wtxn, LAST_SEQ_KEY.as_bytes(), &entry.seq.to_be_bytes())
                .map_err(LmdbError::from)?;
        }
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn complete_entry(&self, seq: u64) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.journal_db
            .delete(&mut wtxn, &seq.to_be_bytes())
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn pending_entries(&self) -> Result<Vec<JournalEntry>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.journal_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut result = Vec::new();
        for entry in iter {
            let (_, val) = entry.map_err(LmdbError::from)?;
            result.push(decode(val)?);
        }
        Ok(result)
    }

    fn last_seq(&self) -> Result<u64, StoreError> {
        let stored = self.get_meta(LAST_SEQ_KEY)?;
        match stored {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Corruption("journal_last_seq has unexpected byte length".into())
                })?;
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }
}
