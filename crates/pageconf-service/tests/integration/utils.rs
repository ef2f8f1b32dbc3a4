use std::time::Duration;

use pageconf_service::config::{Config, SourceConfig};
use pageconf_service::loader::{ConfigLoader, LoadOptions};
use pageconf_test as test;
use reqwest::Url;

pub use test::{ConfigServer, TempDir};

/// Setup tests and create a loader fetching from `url`.
///
/// This function returns a tuple containing the loader to test, and its cache directory. The
/// directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as guard until the
/// test has finished.
///
/// The `update_config` closure can modify any default configuration if needed before the loader
/// is created.
pub fn setup_loader(
    url: Url,
    update_config: impl FnOnce(&mut Config),
) -> (ConfigLoader, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let loader = loader_in(&cache_dir, url, update_config);
    (loader, cache_dir)
}

/// Creates a loader persisting to an existing `cache_dir`.
pub fn loader_in(
    cache_dir: &TempDir,
    url: Url,
    update_config: impl FnOnce(&mut Config),
) -> ConfigLoader {
    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        source: Some(SourceConfig {
            url,
            headers: Default::default(),
        }),
        max_fetch_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    update_config(&mut config);

    ConfigLoader::from_config(&config).unwrap()
}

/// Options that force a synchronous revalidation of expired entries.
pub fn revalidate() -> LoadOptions {
    LoadOptions {
        stale_while_revalidate: Some(false),
        ..Default::default()
    }
}
