use std::time::Duration;

use pageconf_service::loader::{CacheStatus, ErrorKind, LoadOptions};
use serde_json::json;

use crate::{ConfigServer, loader_in, revalidate, setup_loader};

#[tokio::test]
async fn test_cold_load_and_warm_hit() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    let (loader, _cache_dir) = setup_loader(server.url(), |_| {});
    let id = "dashboard-page".into();

    let result = loader.load(&id, Default::default()).await.unwrap();
    assert_eq!(result.cache_status(), CacheStatus::Miss);
    assert_eq!(*result.config, json!({"title": "Dashboard"}));
    assert_eq!(result.etag.as_deref(), Some("\"v1\""));

    let result = loader.load(&id, Default::default()).await.unwrap();
    assert_eq!(result.cache_status(), CacheStatus::Hit);
    assert_eq!(*result.config, json!({"title": "Dashboard"}));

    assert_eq!(server.hits("dashboard-page"), 1);
    assert_eq!(loader.cache_stats().count, 1);
}

#[tokio::test]
async fn test_revalidation_not_modified() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    let (loader, _cache_dir) = setup_loader(server.url(), |config| {
        config.caches.default_ttl = Duration::ZERO;
    });
    let id = "dashboard-page".into();

    loader.load(&id, Default::default()).await.unwrap();
    let result = loader.load(&id, revalidate()).await.unwrap();

    assert!(result.from_cache);
    assert!(!result.stale);
    assert_eq!(*result.config, json!({"title": "Dashboard"}));
    assert_eq!(
        server.validators("dashboard-page"),
        [None, Some("\"v1\"".to_owned())]
    );
}

#[tokio::test]
async fn test_revalidation_updated() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Old"}), "\"v1\"");
    let (loader, _cache_dir) = setup_loader(server.url(), |config| {
        config.caches.default_ttl = Duration::ZERO;
    });
    let id = "dashboard-page".into();

    loader.load(&id, Default::default()).await.unwrap();
    server.set_page("dashboard-page", &json!({"title": "New"}), "\"v2\"");

    let result = loader.load(&id, revalidate()).await.unwrap();
    assert_eq!(result.cache_status(), CacheStatus::Miss);
    assert_eq!(*result.config, json!({"title": "New"}));
    assert_eq!(result.etag.as_deref(), Some("\"v2\""));

    // the new validator is used from now on
    loader.load(&id, revalidate()).await.unwrap();
    assert_eq!(
        server.validators("dashboard-page"),
        [None, Some("\"v1\"".to_owned()), Some("\"v2\"".to_owned())]
    );
}

#[tokio::test]
async fn test_permission_loss() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    let (loader, _cache_dir) = setup_loader(server.url(), |config| {
        config.caches.default_ttl = Duration::ZERO;
    });
    let id = "dashboard-page".into();

    loader.load(&id, Default::default()).await.unwrap();
    server.set_status("dashboard-page", 403);

    let err = loader.load(&id, revalidate()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(err.resource_id().as_str(), "dashboard-page");
    assert!(loader.is_cached(&id));

    // access is restored, and the untouched entry is revalidated
    server.clear_status("dashboard-page");
    let result = loader.load(&id, revalidate()).await.unwrap();
    assert!(result.from_cache);
    assert_eq!(*result.config, json!({"title": "Dashboard"}));
}

#[tokio::test]
async fn test_offline_fallback() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    let (loader, cache_dir) = setup_loader(server.url(), |config| {
        config.caches.default_ttl = Duration::ZERO;
    });
    let id = "dashboard-page".into();
    loader.load(&id, Default::default()).await.unwrap();

    // a second process sharing the cache, without a reachable upstream
    let offline = loader_in(&cache_dir, pageconf_test::unreachable_url(), |config| {
        config.caches.default_ttl = Duration::ZERO;
    });
    let result = offline.load(&id, revalidate()).await.unwrap();
    assert_eq!(result.cache_status(), CacheStatus::Stale);
    assert_eq!(*result.config, json!({"title": "Dashboard"}));
    assert_eq!(result.etag.as_deref(), Some("\"v1\""));

    let err = offline
        .load(&"settings-page".into(), Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);
}

#[tokio::test]
async fn test_server_error_fallback() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    let (loader, _cache_dir) = setup_loader(server.url(), |config| {
        config.caches.default_ttl = Duration::ZERO;
    });
    let id = "dashboard-page".into();
    loader.load(&id, Default::default()).await.unwrap();

    server.set_status("dashboard-page", 503);
    let result = loader.load(&id, revalidate()).await.unwrap();
    assert_eq!(result.cache_status(), CacheStatus::Stale);
}

#[tokio::test]
async fn test_concurrent_loads() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    server.set_delay(Duration::from_millis(200));
    let (loader, _cache_dir) = setup_loader(server.url(), |_| {});
    let id = "dashboard-page".into();

    let loads = (0..8).map(|_| loader.load(&id, Default::default()));
    for result in futures::future::join_all(loads).await {
        assert_eq!(result.unwrap().cache_status(), CacheStatus::Miss);
    }
    assert_eq!(server.hits("dashboard-page"), 1);
}

#[tokio::test]
async fn test_stale_while_revalidate() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Old"}), "\"v1\"");
    let (loader, _cache_dir) = setup_loader(server.url(), |config| {
        config.caches.default_ttl = Duration::ZERO;
    });
    let id = "dashboard-page".into();
    let mut events = loader.subscribe();

    loader.load(&id, Default::default()).await.unwrap();
    server.set_page("dashboard-page", &json!({"title": "New"}), "\"v2\"");

    let result = loader.load(&id, Default::default()).await.unwrap();
    assert_eq!(result.cache_status(), CacheStatus::Stale);
    assert_eq!(*result.config, json!({"title": "Old"}));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.resource_id, id);
    assert_eq!(*event.result.unwrap().config, json!({"title": "New"}));

    // an expired entry is still served stale, but with the revalidated payload
    let result = loader.load(&id, Default::default()).await.unwrap();
    assert_eq!(*result.config, json!({"title": "New"}));
}

#[tokio::test]
async fn test_cache_control() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    server.set_cache_control("dashboard-page", "no-cache");
    let (loader, _cache_dir) = setup_loader(server.url(), |_| {});
    let id = "dashboard-page".into();

    loader.load(&id, Default::default()).await.unwrap();
    let result = loader.load(&id, revalidate()).await.unwrap();
    assert!(result.from_cache);
    assert_eq!(server.hits("dashboard-page"), 2);

    let options = LoadOptions {
        cache_ttl_override: Some(Duration::from_secs(60)),
        stale_while_revalidate: Some(false),
        ..Default::default()
    };
    loader.load(&id, options).await.unwrap();
    loader.load(&id, Default::default()).await.unwrap();
    assert_eq!(server.hits("dashboard-page"), 3);
}

#[tokio::test]
async fn test_required_fields() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"widgets": []}), "\"v1\"");
    server.set_raw_page("broken-page", "<html>", Some("\"v1\""));
    let (loader, _cache_dir) = setup_loader(server.url(), |config| {
        config.validation.required_fields = vec!["title".into()];
    });

    let err = loader
        .load(&"dashboard-page".into(), Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    let err = loader
        .load(&"broken-page".into(), Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    assert_eq!(loader.cache_stats().count, 0);
}
