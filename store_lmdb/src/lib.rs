//! LMDB storage backend for the proxy network engine.
//!
//! Implements all storage traits from `proxy-store` using the `heed` LMDB
//! bindings. Each logical store maps to one LMDB database within a single
//! environment; values are bincode-encoded.

pub mod environment;
pub mod error;
pub mod idempotency;
pub mod integrity;
pub mod journal;
pub mod meta;
pub mod migration;
pub mod node;
pub mod task;

pub use environment::LmdbEnvironment;
pub use error::LmdbError;
pub use integrity::{check_data_dir, check_integrity, IntegrityReport};
pub use migration::{Migrator, CURRENT_SCHEMA_VERSION};

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, LmdbError> {
    bincode::serialize(value).map_err(|e| LmdbError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, LmdbError> {
    bincode::deserialize(bytes).map_err(|e| LmdbError::Corruption(e.to_string()))
}
