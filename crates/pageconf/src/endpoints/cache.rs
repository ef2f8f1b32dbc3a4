use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use pageconf_service::caching::{CacheStats, ResourceId};
use pageconf_service::loader::{ConfigLoader, Failure, classify};
use serde::Serialize;

use super::ResponseError;

#[derive(Debug, Serialize)]
pub struct CachedResponse {
    cached: bool,
}

pub async fn cache_stats(State(loader): State<ConfigLoader>) -> Json<CacheStats> {
    Json(loader.cache_stats())
}

pub async fn is_cached(
    State(loader): State<ConfigLoader>,
    Path(resource_id): Path<String>,
) -> Json<CachedResponse> {
    let cached = loader.is_cached(&resource_id.into());
    Json(CachedResponse { cached })
}

pub async fn invalidate(
    State(loader): State<ConfigLoader>,
    Path(resource_id): Path<String>,
) -> Result<StatusCode, ResponseError> {
    let resource_id = ResourceId::from(resource_id);
    loader
        .clear_cache(Some(&resource_id))
        .map_err(|err| classify(&resource_id, Failure::Storage(err)))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_cache(State(loader): State<ConfigLoader>) -> Result<StatusCode, ResponseError> {
    loader.clear_cache(None)?;
    Ok(StatusCode::NO_CONTENT)
}
