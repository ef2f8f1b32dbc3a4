//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pageconf_service::caching::{self, ResourceId};
use pageconf_service::config::Config;
use pageconf_service::loader::{ConfigLoader, LoadOptions};
use pageconf_service::metrics;

use crate::logging;
use crate::server;

/// Pageconf commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web server.
    Run,

    /// Load a single page configuration and print it.
    Fetch {
        /// The identifier of the page configuration, e.g. `dashboard-page`.
        resource_id: String,

        /// Revalidate against the upstream even if a fresh copy is cached.
        #[arg(long)]
        skip_cache: bool,
    },

    /// Clean local caches.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Fetch {
            resource_id,
            skip_cache,
        } => fetch(config, resource_id.into(), skip_cache)
            .context("failed to load page configuration")?,
        Command::Cleanup { dry_run } => {
            caching::cleanup(config, dry_run).context("failed to clean up caches")?
        }
    }

    Ok(())
}

fn fetch(config: Config, resource_id: ResourceId, skip_cache: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let loader = ConfigLoader::from_config(&config)?;

    let options = LoadOptions {
        skip_cache,
        // nobody would be around to see the background refresh
        stale_while_revalidate: Some(false),
        ..Default::default()
    };
    let result = runtime.block_on(loader.load(&resource_id, options))?;

    tracing::info!(
        cache = result.cache_status().as_str(),
        etag = result.etag.as_deref(),
        "Loaded page configuration `{}`",
        resource_id
    );

    println!("{}", serde_json::to_string_pretty(&result.config)?);
    Ok(())
}
