use std::fmt;

use thiserror::Error;

/// Failure reported by a [`RemoteStore`](super::RemoteStore) implementation.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote store unreachable: {0}")]
    Unreachable(String),
    #[error("remote command `{command}` timed out")]
    Timeout { command: &'static str },
    #[error("remote command failed: {0}")]
    Command(String),
    #[error("unexpected reply from remote store: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable(message.into())
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// A single key that could not be written as part of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailures(pub Vec<BatchFailure>);

impl BatchFailures {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|failure| failure.key.as_str())
    }
}

impl fmt::Display for BatchFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, failure) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "`{}` ({})", failure.key, failure.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable")]
    Unavailable,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("failed to serialize value for `{key}`: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to deserialize cached value for `{key}`: {source}")]
    Deserialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("batch write failed for {failures}")]
    Batch { failures: BatchFailures },
    #[error("ttl for `{key}` must be greater than zero")]
    InvalidTtl { key: String },
    #[error("lock `{key}` not found or expired")]
    LockNotHeld { key: String },
    #[error("failed to unlock `{key}`: lock not owned or expired")]
    LockNotOwned { key: String },
}

impl CacheError {
    /// True for errors that mean the caller does not hold the lock it tried to release.
    pub fn is_ownership_violation(&self) -> bool {
        matches!(self, Self::LockNotHeld { .. } | Self::LockNotOwned { .. })
    }

    /// True when the remote tier could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable
                | Self::Remote(RemoteError::Unreachable(_))
                | Self::Remote(RemoteError::Timeout { .. })
        )
    }
}
