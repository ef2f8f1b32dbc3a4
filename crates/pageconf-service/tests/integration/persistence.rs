use pageconf_service::loader::CacheStatus;
use serde_json::json;

use crate::{ConfigServer, loader_in, setup_loader};

#[tokio::test]
async fn test_warm_cache_survives_restart() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    let (loader, cache_dir) = setup_loader(server.url(), |_| {});
    let id = "dashboard-page".into();

    loader.load(&id, Default::default()).await.unwrap();
    drop(loader);

    let restarted = loader_in(&cache_dir, server.url(), |_| {});
    assert!(restarted.is_cached(&id));
    let result = restarted.load(&id, Default::default()).await.unwrap();
    assert_eq!(result.cache_status(), CacheStatus::Hit);
    assert_eq!(server.hits("dashboard-page"), 1);
}

#[tokio::test]
async fn test_clear_cache_removes_files() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    let (loader, cache_dir) = setup_loader(server.url(), |_| {});
    let id = "dashboard-page".into();

    loader.load(&id, Default::default()).await.unwrap();
    loader.clear_cache(Some(&id)).unwrap();

    let restarted = loader_in(&cache_dir, server.url(), |_| {});
    assert!(!restarted.is_cached(&id));

    let result = restarted.load(&id, Default::default()).await.unwrap();
    assert_eq!(result.cache_status(), CacheStatus::Miss);
    assert_eq!(server.hits("dashboard-page"), 2);
}

#[tokio::test]
async fn test_dev_mode_bypasses_cache() {
    let server = ConfigServer::new();
    server.set_page("dashboard-page", &json!({"title": "Dashboard"}), "\"v1\"");
    let (loader, _cache_dir) = setup_loader(server.url(), |config| config.dev_mode = true);
    let id = "dashboard-page".into();

    for _ in 0..3 {
        loader.load(&id, Default::default()).await.unwrap();
    }
    assert_eq!(server.hits("dashboard-page"), 3);
}
