use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// Timeouts applied to every upstream fetch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FetchTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one fetch, including reading the body.
    pub max_fetch: Duration,
}

impl FetchTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_fetch: config.max_fetch_timeout,
        }
    }
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            max_fetch: Duration::from_secs(10),
        }
    }
}

/// Creates a [`reqwest::Client`] for talking to the config upstream.
///
/// Responses are transparently decompressed. Redirects are followed, but a configuration
/// endpoint redirecting more than a handful of times is treated as broken.
pub fn create_client(timeouts: &FetchTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .user_agent(concat!("pageconf/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_fetch)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(5))
        .build()
}
