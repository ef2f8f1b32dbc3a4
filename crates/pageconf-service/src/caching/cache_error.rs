use std::io;
use std::sync::Arc;

use thiserror::Error;

/// A failure of the cache storage layer.
///
/// These are never fatal for a load: the loader treats the affected key as a cache miss.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Reading or writing a cache file failed.
    #[error("cache i/o failed: {0}")]
    Io(#[source] Arc<io::Error>),
    /// A cache file could not be (de)serialized.
    #[error("malformed cache file: {0}")]
    Malformed(#[source] Arc<serde_json::Error>),
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(Arc::new(err))
    }
}

impl From<tempfile::PersistError> for CacheError {
    fn from(err: tempfile::PersistError) -> Self {
        Self::Io(Arc::new(err.error))
    }
}

impl CacheError {
    /// A short name used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// The result of a cache storage operation.
pub type CacheContents<T = ()> = Result<T, CacheError>;
