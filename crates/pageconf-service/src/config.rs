use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "pageconf".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The upstream that serves page configurations.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    /// Base URL, the resource id is appended as the last path segment.
    pub url: Url,
    /// Additional headers sent with every request, e.g. `Authorization`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Cache policy and sizing.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a freshly fetched configuration is served without revalidation.
    ///
    /// Used when neither the caller nor the upstream (`Cache-Control: max-age`) specify one.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Serve expired entries immediately and revalidate them in the background.
    ///
    /// Callers can override this per request.
    pub stale_while_revalidate: bool,

    /// Serve an expired entry instead of failing when the upstream cannot be reached.
    pub stale_fallback: bool,

    /// Honor `Cache-Control: max-age` / `no-cache` sent by the upstream.
    pub respect_cache_control: bool,

    /// Capacity (in bytes) of the in-memory cache.
    ///
    /// The size of an entry is a best-effort approximation of its serialized payload.
    pub in_memory_capacity: u64,

    /// Maximum number of stale-while-revalidate refreshes running at the same time.
    pub max_background_revalidations: isize,

    /// Maximum duration since last use of a file in `cache_dir` before `cleanup` removes it.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            stale_while_revalidate: true,
            stale_fallback: true,
            respect_cache_control: true,
            in_memory_capacity: 64 * 1024 * 1024,
            max_background_revalidations: 20,
            max_unused_for: Some(Duration::from_secs(3600 * 24 * 7)),
        }
    }
}

/// Structural requirements for fetched configurations.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Top-level fields that every configuration object must contain.
    pub required_fields: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to persist cached configurations to. Default is memory only.
    pub cache_dir: Option<PathBuf>,
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,
    /// Disables all caching, every load goes to the upstream.
    pub dev_mode: bool,
    /// Configuration for internal logging.
    pub logging: Logging,
    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
    /// The upstream serving page configurations.
    pub source: Option<SourceConfig>,
    /// Fine-tune caching behavior.
    pub caches: CacheConfig,
    /// Validation applied to every fetched configuration.
    pub validation: ValidationConfig,
    /// The timeout for establishing a connection to the upstream.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// The upper limit for a single fetch, including reading the body.
    #[serde(with = "humantime_serde")]
    pub max_fetch_timeout: Duration,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no caching to disk should
    /// happen and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            bind: "127.0.0.1:3021".to_owned(),
            dev_mode: false,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            source: None,
            caches: CacheConfig::default(),
            validation: ValidationConfig::default(),
            connect_timeout: Duration::from_secs(1),
            max_fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        // It should be possible to set individual values in reasonable units without
        // affecting the other defaults.
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.default_ttl, Duration::from_secs(300));

        let yaml = r#"
            caches:
              default_ttl: 30s
              stale_while_revalidate: false
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.default_ttl, Duration::from_secs(30));
        assert!(!cfg.caches.stale_while_revalidate);
        assert!(cfg.caches.stale_fallback);
        assert_eq!(
            cfg.caches.max_unused_for,
            CacheConfig::default().max_unused_for
        );
    }

    #[test]
    fn test_disabling_expiry() {
        let yaml = r#"
            caches:
              max_unused_for: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.max_unused_for, None);
        assert_eq!(cfg.caches.default_ttl, CacheConfig::default().default_ttl);
    }

    #[test]
    fn test_source() {
        let yaml = r#"
            dev_mode: true
            source:
              url: "https://backend.example.com/api/pages/"
              headers:
                Authorization: "Bearer secret"
            validation:
              required_fields: [title, widgets]
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert!(cfg.dev_mode);

        let source = cfg.source.unwrap();
        assert_eq!(source.url.as_str(), "https://backend.example.com/api/pages/");
        assert_eq!(source.headers["Authorization"], "Bearer secret");
        assert_eq!(cfg.validation.required_fields, ["title", "widgets"]);
    }

    #[test]
    fn test_zero_second_timeouts() {
        // 0s timeouts will not be set to defaults
        let yaml = r#"
            max_fetch_timeout: 0s
            connect_timeout: 0s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.max_fetch_timeout, Duration::from_secs(0));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(0));
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_log_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);
    }
}
