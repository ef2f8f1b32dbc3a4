use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use pageconf_service::caching::ResourceId;
use pageconf_service::loader::{ConfigLoader, LoadOptions};
use serde::{Deserialize, Deserializer};

use super::ResponseError;

/// Query parameters of `GET /configs/{resource_id}`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoadQuery {
    /// Revalidate even if a fresh copy is cached. A bare `?skip_cache` counts as `true`.
    #[serde(deserialize_with = "deserialize_flag")]
    skip_cache: bool,
    /// Overrides the TTL of a freshly fetched entry, e.g. `30s`.
    #[serde(with = "humantime_serde")]
    ttl: Option<Duration>,
    stale_while_revalidate: Option<bool>,
}

fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = String::deserialize(deserializer)?;
    match value.as_str() {
        "" | "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Str(other),
            &"a boolean flag",
        )),
    }
}

impl From<LoadQuery> for LoadOptions {
    fn from(query: LoadQuery) -> Self {
        LoadOptions {
            skip_cache: query.skip_cache,
            cache_ttl_override: query.ttl,
            stale_while_revalidate: query.stale_while_revalidate,
            cancellation: None,
        }
    }
}

pub async fn load_config(
    State(loader): State<ConfigLoader>,
    Path(resource_id): Path<String>,
    Query(query): Query<LoadQuery>,
) -> Result<Response, ResponseError> {
    let resource_id = ResourceId::from(resource_id);
    // A client that disconnects drops this future. The fetch itself keeps running for everyone
    // else waiting on it.
    let result = loader.load(&resource_id, query.into()).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-cache",
        HeaderValue::from_static(result.cache_status().as_str()),
    );
    if let Some(etag) = result.etag.as_deref().and_then(|e| e.parse().ok()) {
        headers.insert(header::ETAG, etag);
    }

    Ok((headers, Json(result.config)).into_response())
}
