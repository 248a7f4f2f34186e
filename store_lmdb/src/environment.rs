//! LMDB environment setup.

use std::path::Path;
use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use proxy_store::{Store, StoreError};

use crate::LmdbError;

/// Names of every database the engine keeps in one environment.
pub const DATABASES: &[&str] = &["nodes", "tasks", "node_tasks", "journal", "idempotency", "meta"];

/// Wraps the LMDB environment and all database handles.
pub struct LmdbEnvironment {
    pub(crate) env: Arc<Env>,
    pub(crate) nodes_db: Database<Bytes, Bytes>,
    pub(crate) tasks_db: Database<Bytes, Bytes>,
    /// `node_id || task_id` -> empty.
    pub(crate) node_tasks_db: Database<Bytes, Bytes>,
    /// big-endian `seq` -> entry.
    pub(crate) journal_db: Database<Bytes, Bytes>,
    pub(crate) idempotency_db: Database<Bytes, Bytes>,
    pub(crate) meta_db: Database<Bytes, Bytes>,
}

impl LmdbEnvironment {
    /// Open or create an LMDB environment at the given path.
    pub fn open(path: &Path, map_size: usize) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(path)?;
        // SAFETY: the engine is the only process that opens this directory,
        // and the environment is opened exactly once per process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(DATABASES.len() as u32)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let nodes_db = env.create_database(&mut wtxn, Some("nodes"))?;
        let tasks_db = env.create_database(&mut wtxn, Some("tasks"))?;
        let node_tasks_db = env.create_database(&mut wtxn, Some("node_tasks"))?;
        let journal_db = env.create_database(&mut wtxn, Some("journal"))?;
        let idempotency_db = env.create_database(&mut wtxn, Some("idempotency"))?;
        let meta_db = env.create_database(&mut wtxn, Some("meta"))?;
        wtxn.commit()?;

        tracing::debug!(path = %path.display(), map_size, "opened LMDB environment");

        Ok(Self {
            env: Arc::new(env),
            nodes_db,
            tasks_db,
            node_tasks_db,
            journal_db,
            idempotency_db,
            meta_db,
        })
    }

    pub fn env(&self) -> &Arc<Env> {
        &self.env
    }
}

impl Store for LmdbEnvironment {
    fn flush(&self) -> Result<(), StoreError> {
        self.env.force_sync().map_err(LmdbError::from)?;
        Ok(())
    }
}
