use axum::Router;
use axum::routing::get;
use pageconf_service::loader::ConfigLoader;
use pageconf_service::metric;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

mod cache;
mod configs;
mod error;
mod metrics;

pub use error::ResponseError;
use metrics::MetricsLayer;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(loader: ConfigLoader) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/configs/:resource_id", get(configs::load_config))
        .route("/cache", axum::routing::delete(cache::clear_cache))
        .route("/cache/stats", get(cache::cache_stats))
        .route(
            "/cache/:resource_id",
            get(cache::is_cached).delete(cache::invalidate),
        )
        .with_state(loader)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::test;

    #[tokio::test]
    async fn test_healthcheck() {
        test::setup();
        let (server, _upstream, _cache_dir) = test::server(|_| {});

        let response = reqwest::get(server.url("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        test::setup();
        let (server, _upstream, _cache_dir) = test::server(|_| {});

        let response = reqwest::get(server.url("/pages")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
