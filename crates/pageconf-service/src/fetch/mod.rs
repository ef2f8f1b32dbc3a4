//! Fetching page configurations from the upstream.
//!
//! A [`ConfigSource`] answers a (conditional) request for a single resource with a
//! [`FetchOutcome`]. Sources never fail in the `Result` sense: every transport problem is an
//! outcome of its own, which the loader then classifies.

use std::error::Error;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::caching::ResourceId;

mod http;

pub use http::{HttpSource, parse_max_age};

/// The result of asking the upstream for a page configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// A new payload was returned.
    Updated {
        payload: Value,
        etag: Option<String>,
        /// The freshness lifetime the upstream asked for, if any.
        max_age: Option<Duration>,
    },
    /// The known ETag is still current, the cached payload may be reused.
    NotModified,
    /// The resource does not exist.
    NotFound,
    /// The caller is not allowed to access the resource.
    Forbidden,
    /// The upstream could not be reached or answered with an unexpected status.
    TransportFailure { cause: TransportError },
    /// The upstream answered successfully, but the body is not a JSON document.
    Malformed { details: String },
}

impl FetchOutcome {
    /// A short name used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Updated { .. } => "updated",
            Self::NotModified => "not_modified",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::TransportFailure { .. } => "transport_failure",
            Self::Malformed { .. } => "malformed",
        }
    }
}

/// Why a request to the upstream did not produce a usable answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("unexpected status code {0}")]
    Status(u16),
}

impl TransportError {
    fn connection_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }
        Self::Connection(error.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::Status(status.as_u16()),
            None => Self::connection_error(&error),
        }
    }
}

/// The upstream serving page configurations.
///
/// `known_etag` is the validator of the currently cached entry, if any. Implementations send
/// it along so that the upstream can answer with [`FetchOutcome::NotModified`].
pub trait ConfigSource: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        resource_id: &'a ResourceId,
        known_etag: Option<&'a str>,
    ) -> BoxFuture<'a, FetchOutcome>;
}
