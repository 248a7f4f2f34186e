use thiserror::Error;

#[derive(Debug, Error)]
pub enum LmdbError {
    #[error("LMDB error: {0}")]
    Heed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted record: {0}")]
    Corruption(String),
}

impl From<heed::Error> for LmdbError {
    fn from(e: heed::Error) -> Self {
        match e {
            heed::Error::Io(io) => LmdbError::Io(io),
            other => LmdbError::Heed(other.to_string()),
        }
    }
}

impl From<LmdbError> for proxy_store::StoreError {
    fn from(e: LmdbError) -> Self {
        match e {
            LmdbError::Corruption(msg) => proxy_store::StoreError::Corruption(msg),
            LmdbError::Serialization(msg) => proxy_store::StoreError::Serialization(msg),
            other => proxy_store::StoreError::Backend(other.to_string()),
        }
    }
}
