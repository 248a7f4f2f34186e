use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("os randomness unavailable: {0}")]
    Rng(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}
