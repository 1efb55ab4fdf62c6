use thiserror::Error;

use crate::cache::CacheError;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("database error: {message}")]
    Database { message: String },
    #[error("query timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
    #[error("failed to decode query rows: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("batch item {index} failed: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<QueryError>,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl QueryError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Index of the failing item for batch errors.
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            Self::Batch { index, .. } => Some(*index),
            _ => None,
        }
    }
}
