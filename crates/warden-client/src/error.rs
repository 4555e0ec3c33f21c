//! Error types for the failover client

use thiserror::Error;
use warden_core::WardenError;

/// Result type alias for failover client operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The retry budget ran out; callers see this instead of partial data
    #[error("operation timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// A command against the primary failed
    #[error("redis error: {0}")]
    Redis(String),

    /// Sentinel could not tell us where the primary is
    #[error("primary lookup failed: {0}")]
    Lookup(String),

    #[error("failed to connect: {0}")]
    Connection(String),

    #[error(transparent)]
    Core(#[from] WardenError),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Redis(e.to_string())
    }
}
