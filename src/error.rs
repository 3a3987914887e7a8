//! Error types for Redbucket.

use thiserror::Error;

use crate::ratelimit::CodecError;

/// Main error type for Redbucket operations.
///
/// A rejected request is not an error: errors mean the limiter could not
/// determine a decision at all.
#[derive(Error, Debug)]
pub enum RedbucketError {
    /// Invalid limits, zones, key formats or requests naming unknown limits
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored counter state could not be decoded
    #[error("Corrupt state for key {key:?}: {source}")]
    StateCorruption {
        key: String,
        #[source]
        source: CodecError,
    },

    /// The optimistic backend lost every compare-and-swap round
    #[error("Backend contention: gave up after {attempts} attempts")]
    Contention { attempts: u32 },

    /// Network or store failure during a round trip
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RedbucketError {
    pub(crate) fn corruption(key: &[u8], source: CodecError) -> Self {
        RedbucketError::StateCorruption {
            key: String::from_utf8_lossy(key).into_owned(),
            source,
        }
    }

    /// Whether the caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RedbucketError::Contention { .. } | RedbucketError::StoreUnavailable(_)
        )
    }
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for RedbucketError {
    fn from(err: redis::RedisError) -> Self {
        RedbucketError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Redbucket operations.
pub type Result<T> = std::result::Result<T, RedbucketError>;
