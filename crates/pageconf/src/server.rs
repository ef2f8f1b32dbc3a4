use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use pageconf_service::config::Config;
use pageconf_service::loader::ConfigLoader;
use pageconf_service::metric;

use crate::endpoints;

/// How long in-flight requests may take to finish once a shutdown was requested.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Starts the loader and the HTTP server based on loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // loader creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("pageconf-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let loader = ConfigLoader::from_config(&config).context("failed to create loader")?;
    let socket = config.bind.parse::<SocketAddr>()?;

    let handle = axum_server::Handle::new();
    web_pool.spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
            }
        }
    });

    tracing::info!("Starting HTTP server on {}", socket);
    let server = axum_server::bind(socket)
        .handle(handle)
        .serve(endpoints::create_app(loader).into_make_service());
    web_pool.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
