//! Support to fetch page configurations from an HTTP upstream.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::caching::ResourceId;
use crate::config::SourceConfig;
use crate::utils::http::{FetchTimeouts, create_client};

use super::{ConfigSource, FetchOutcome, TransportError};

/// [`ConfigSource`] requesting `GET <url>/<resource_id>` from an HTTP upstream.
#[derive(Debug)]
pub struct HttpSource {
    client: Client,
    url: Url,
    headers: HeaderMap,
    timeouts: FetchTimeouts,
}

impl HttpSource {
    pub fn new(source: &SourceConfig, timeouts: FetchTimeouts) -> anyhow::Result<Self> {
        let client = create_client(&timeouts)?;
        Self::with_client(client, source, timeouts)
    }

    pub fn with_client(
        client: Client,
        source: &SourceConfig,
        timeouts: FetchTimeouts,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !source.url.cannot_be_a_base(),
            "source url `{}` cannot be used as a base url",
            source.url
        );

        let mut headers = HeaderMap::new();
        for (key, value) in &source.headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(key), Ok(value)) => {
                    headers.insert(key, value);
                }
                _ => tracing::warn!("Ignoring invalid source header `{}`", key),
            }
        }

        Ok(Self {
            client,
            url: source.url.clone(),
            headers,
            timeouts,
        })
    }

    /// The URL a resource is fetched from.
    ///
    /// The id is appended as a single, percent-encoded path segment.
    pub fn url_for(&self, resource_id: &ResourceId) -> Url {
        let mut url = self.url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(resource_id.as_str());
        }
        url
    }

    fn transport_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeouts.max_fetch)
        } else {
            error.into()
        }
    }

    async fn fetch_once(&self, resource_id: &ResourceId, known_etag: Option<&str>) -> FetchOutcome {
        let url = self.url_for(resource_id);
        tracing::debug!("Fetching config `{}` from `{}`", resource_id, url);

        let mut builder = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .header(header::ACCEPT, "application/json");
        if let Some(etag) = known_etag {
            builder = builder.header(header::IF_NONE_MATCH, etag);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Failed to reach upstream for `{}`: {}", resource_id, e);
                return FetchOutcome::TransportFailure {
                    cause: self.transport_error(e),
                };
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            tracing::trace!("Config `{}` not modified", resource_id);
            return FetchOutcome::NotModified;
        }

        if status.is_success() {
            let headers = response.headers();
            let etag = headers
                .get(header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let max_age = headers
                .get(header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_max_age);

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    return FetchOutcome::TransportFailure {
                        cause: self.transport_error(e),
                    };
                }
            };
            return match serde_json::from_slice(&body) {
                Ok(payload) => FetchOutcome::Updated {
                    payload,
                    etag,
                    max_age,
                },
                Err(e) => FetchOutcome::Malformed {
                    details: e.to_string(),
                },
            };
        }

        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                tracing::debug!("Config `{}` not found: {}", resource_id, status);
                FetchOutcome::NotFound
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::debug!("Insufficient permissions to fetch `{}`: {}", resource_id, status);
                FetchOutcome::Forbidden
            }
            _ => {
                tracing::debug!("Unexpected status fetching `{}`: {}", resource_id, status);
                FetchOutcome::TransportFailure {
                    cause: TransportError::Status(status.as_u16()),
                }
            }
        }
    }
}

impl ConfigSource for HttpSource {
    fn fetch<'a>(
        &'a self,
        resource_id: &'a ResourceId,
        known_etag: Option<&'a str>,
    ) -> BoxFuture<'a, FetchOutcome> {
        Box::pin(async move {
            let timeout = self.timeouts.max_fetch;
            match tokio::time::timeout(timeout, self.fetch_once(resource_id, known_etag)).await {
                Ok(outcome) => outcome,
                Err(_) => FetchOutcome::TransportFailure {
                    cause: TransportError::Timeout(timeout),
                },
            }
        })
    }
}

/// Parses the freshness lifetime out of a `Cache-Control` header value.
///
/// `no-cache` and `no-store` yield a lifetime of zero, which requires revalidation on every
/// load.
pub fn parse_max_age(cache_control: &str) -> Option<Duration> {
    let mut max_age = None;
    for directive in cache_control.split(',') {
        let (name, value) = match directive.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
            None => (directive.trim(), None),
        };

        if name.eq_ignore_ascii_case("no-cache") || name.eq_ignore_ascii_case("no-store") {
            return Some(Duration::ZERO);
        }
        if name.eq_ignore_ascii_case("max-age") {
            max_age = value
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs);
        }
    }
    max_age
}
