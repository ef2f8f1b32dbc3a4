use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;

use crate::caching::{CacheError, ResourceId};
use crate::fetch::TransportError;

use super::validate::ValidationError;

/// The category of a failed load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The upstream does not know the resource.
    NotFound,
    /// The upstream denied access to the resource.
    Forbidden,
    /// The upstream could not be reached, timed out, or failed on its end.
    NetworkError,
    /// The upstream returned a payload that is not a valid configuration.
    InvalidConfig,
    /// The cache storage failed.
    CacheError,
    /// The caller cancelled the load.
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::NetworkError => "network_error",
            Self::InvalidConfig => "invalid_config",
            Self::CacheError => "cache_error",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Arc<dyn Error + Send + Sync + 'static>;

/// A load that did not produce a configuration.
#[derive(Debug, Clone, Error)]
#[error("{kind}: `{resource_id}`")]
pub struct LoadError {
    kind: ErrorKind,
    resource_id: ResourceId,
    #[source]
    cause: Option<Cause>,
}

impl LoadError {
    pub fn new(kind: ErrorKind, resource_id: ResourceId) -> Self {
        Self {
            kind,
            resource_id,
            cause: None,
        }
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// The underlying failure, if there was one.
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Whether retrying the same load later may succeed.
    ///
    /// The loader itself never retries.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::NetworkError
    }
}

/// The upstream confirmed a cached entry which no longer exists.
#[derive(Debug, Clone, Copy, Error)]
#[error("upstream answered `304 Not Modified` but nothing is cached")]
pub struct UnexpectedNotModified;

/// Everything that can go wrong while loading a configuration.
#[derive(Debug)]
pub enum Failure {
    NotFound,
    Forbidden,
    Transport(TransportError),
    Invalid(ValidationError),
    Storage(CacheError),
    Cancelled,
    UnexpectedNotModified,
    Task(JoinError),
}

/// Maps a [`Failure`] into the [`LoadError`] taxonomy.
pub fn classify(resource_id: &ResourceId, failure: Failure) -> LoadError {
    let error = |kind| LoadError::new(kind, resource_id.clone());
    match failure {
        Failure::NotFound => error(ErrorKind::NotFound),
        Failure::Forbidden => error(ErrorKind::Forbidden),
        Failure::Transport(cause) => error(ErrorKind::NetworkError).with_cause(cause),
        Failure::Invalid(cause) => error(ErrorKind::InvalidConfig).with_cause(cause),
        Failure::Storage(cause) => error(ErrorKind::CacheError).with_cause(cause),
        Failure::Cancelled => error(ErrorKind::Cancelled),
        Failure::UnexpectedNotModified => {
            error(ErrorKind::Unknown).with_cause(UnexpectedNotModified)
        }
        Failure::Task(cause) => error(ErrorKind::Unknown).with_cause(cause),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn chain(error: &dyn Error) -> String {
        let mut out = error.to_string();
        let mut source = error.source();
        while let Some(err) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }

    #[test]
    fn test_classify() {
        let id = ResourceId::new("dashboard-page");

        let err = classify(&id, Failure::Forbidden);
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(err.resource_id(), &id);
        assert!(err.cause().is_none());
        insta::assert_snapshot!(err.to_string(), @"forbidden: `dashboard-page`");

        let err = classify(
            &id,
            Failure::Transport(TransportError::Timeout(Duration::from_secs(10))),
        );
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        insta::assert_snapshot!(chain(&err), @r###"
        network_error: `dashboard-page`
          caused by: request timed out after 10s
        "###);

        let err = classify(&id, Failure::Invalid(ValidationError::MissingField("title".into())));
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        insta::assert_snapshot!(chain(&err), @r###"
        invalid_config: `dashboard-page`
          caused by: missing required field `title`
        "###);

        let err = classify(&id, Failure::UnexpectedNotModified);
        assert_eq!(err.kind(), ErrorKind::Unknown);

        let io = std::io::Error::other("disk on fire");
        let err = classify(&id, Failure::Storage(io.into()));
        assert_eq!(err.kind(), ErrorKind::CacheError);

        assert_eq!(classify(&id, Failure::NotFound).kind(), ErrorKind::NotFound);
        assert_eq!(classify(&id, Failure::Cancelled).kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_retryable() {
        let id = ResourceId::new("dashboard-page");
        let retryable = |kind| LoadError::new(kind, id.clone()).is_retryable();

        assert!(retryable(ErrorKind::NetworkError));
        assert!(!retryable(ErrorKind::NotFound));
        assert!(!retryable(ErrorKind::Forbidden));
        assert!(!retryable(ErrorKind::InvalidConfig));
        assert!(!retryable(ErrorKind::Cancelled));
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::InvalidConfig).unwrap();
        assert_eq!(json, r#""invalid_config""#);
        assert_eq!(ErrorKind::NetworkError.to_string(), "network_error");
    }
}
