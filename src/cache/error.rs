//! Errors raised by the Redis layer.

use thiserror::Error;

use crate::services::idempotency::IdempotencyError;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Pool checkout failed or Redis did not answer
    #[error("redis unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be encoded or decoded
    #[error("idempotency record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        CacheError::Unavailable(format!("pool: {}", err))
    }
}

impl CacheError {
    /// Maps to the store error for `key`. Unreadable records are reported as
    /// corrupt instead of as an outage.
    pub fn for_key(self, key: &str) -> IdempotencyError {
        match self {
            CacheError::Encoding(e) => IdempotencyError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            },
            CacheError::Unavailable(message) => IdempotencyError::Unavailable(message),
        }
    }
}

impl From<CacheError> for IdempotencyError {
    fn from(err: CacheError) -> Self {
        IdempotencyError::Unavailable(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
