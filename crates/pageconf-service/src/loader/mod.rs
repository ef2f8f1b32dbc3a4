//! The public entry point for loading page configurations.
//!
//! A [`ConfigLoader`] decides for every [`load`](ConfigLoader::load) whether the cached entry
//! can be served as is, needs to be revalidated with the upstream, or has to be fetched. It:
//!
//! - serves fresh entries without touching the network,
//! - revalidates expired entries with a conditional request (`If-None-Match`),
//! - serves expired entries right away and revalidates them in the background when
//!   stale-while-revalidate is enabled,
//! - collapses concurrent fetches of the same resource into one,
//! - falls back to the expired entry when the upstream cannot be reached.
//!
//! Every load resolves to either a [`LoadResult`] or a [`LoadError`].

use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::time::{Duration, SystemTime};

use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheEntry, CacheError, CacheStats, CacheStore, ResourceId};
use crate::config::{CacheConfig, Config};
use crate::fetch::{ConfigSource, FetchOutcome, HttpSource, TransportError};
use crate::utils::futures::CallOnDrop;
use crate::utils::http::FetchTimeouts;

mod dedup;
mod error;
mod validate;

pub use dedup::{Deduplicator, SharedLoad};
pub use error::{ErrorKind, Failure, LoadError, UnexpectedNotModified, classify};
pub use validate::{ConfigValidator, StructuralValidator, ValidationError};

/// Capacity of the revalidation event channel. Slow subscribers miss older events.
const EVENT_CAPACITY: usize = 64;

/// Per-call options of [`ConfigLoader::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Ignore any cached entry and ask the upstream.
    ///
    /// The cached ETag is still sent along, and the cached entry still serves as a fallback.
    pub skip_cache: bool,
    /// Lifetime of the entry stored by this load, instead of the configured one.
    pub cache_ttl_override: Option<Duration>,
    /// Overrides `caches.stale_while_revalidate` for this call.
    pub stale_while_revalidate: Option<bool>,
    /// Detaches this caller from the load when cancelled.
    ///
    /// A fetch shared with other callers keeps running.
    pub cancellation: Option<CancellationToken>,
}

/// Where the payload of a [`LoadResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Served from the cache, either fresh or confirmed by the upstream.
    Hit,
    /// Transferred from the upstream.
    Miss,
    /// Served from the cache past its lifetime, without confirmation.
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Stale => "stale",
        }
    }
}

/// A successfully loaded page configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadResult {
    pub config: Arc<Value>,
    /// `true` unless the payload was transferred by the upstream for this load.
    pub from_cache: bool,
    pub etag: Option<String>,
    pub loaded_at: SystemTime,
    /// `true` if the payload is past its lifetime and was not confirmed by the upstream.
    pub stale: bool,
}

impl LoadResult {
    fn cached(entry: &CacheEntry, stale: bool) -> Self {
        Self {
            config: Arc::clone(&entry.payload),
            from_cache: true,
            etag: entry.etag.clone(),
            loaded_at: SystemTime::now(),
            stale,
        }
    }

    fn fetched(entry: &CacheEntry) -> Self {
        Self {
            from_cache: false,
            ..Self::cached(entry, false)
        }
    }

    pub fn cache_status(&self) -> CacheStatus {
        match (self.from_cache, self.stale) {
            (false, _) => CacheStatus::Miss,
            (true, false) => CacheStatus::Hit,
            (true, true) => CacheStatus::Stale,
        }
    }
}

/// Published whenever a background revalidation settles.
#[derive(Debug, Clone)]
pub struct RevalidationEvent {
    pub resource_id: ResourceId,
    pub result: Result<LoadResult, LoadError>,
}

/// Loads page configurations through a [`CacheStore`] from a [`ConfigSource`].
///
/// Cloning is cheap, all clones share the same cache and in-flight loads.
#[derive(Clone)]
pub struct ConfigLoader {
    store: CacheStore,
    source: Arc<dyn ConfigSource>,
    validator: Arc<dyn ConfigValidator>,
    policy: CacheConfig,
    dev_mode: bool,
    fetch_timeout: Duration,
    in_flight: Deduplicator<LoadResult>,
    /// Remaining budget of background revalidations, counting down towards zero.
    revalidation_budget: Arc<AtomicIsize>,
    events: broadcast::Sender<RevalidationEvent>,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("store", &self.store)
            .field("policy", &self.policy)
            .field("dev_mode", &self.dev_mode)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl ConfigLoader {
    pub fn new(store: CacheStore, source: Arc<dyn ConfigSource>, policy: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            source,
            validator: Arc::new(StructuralValidator::default()),
            policy,
            dev_mode: false,
            fetch_timeout: FetchTimeouts::default().max_fetch,
            in_flight: Deduplicator::new(),
            revalidation_budget: Arc::new(AtomicIsize::new(policy.max_background_revalidations)),
            events,
        }
    }

    /// Creates a loader fetching from the configured HTTP `source`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let Some(source) = &config.source else {
            anyhow::bail!("no `source` configured");
        };
        let timeouts = FetchTimeouts::from_config(config);
        let source = HttpSource::new(source, timeouts)?;
        let store = CacheStore::from_config(config)?;

        Ok(Self::new(store, Arc::new(source), config.caches)
            .with_validator(StructuralValidator::from_config(&config.validation))
            .with_dev_mode(config.dev_mode)
            .with_fetch_timeout(timeouts.max_fetch))
    }

    pub fn with_validator(mut self, validator: impl ConfigValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Development mode bypasses the cache on every load.
    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self.store = self.store.with_bypass(dev_mode);
        self
    }

    /// Upper bound for a single call to the [`ConfigSource`].
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Loads the configuration for `resource_id`.
    pub async fn load(
        &self,
        resource_id: &ResourceId,
        options: LoadOptions,
    ) -> Result<LoadResult, LoadError> {
        let cancellation = options.cancellation.clone();
        let load = self.load_inner(resource_id, options);

        let result = match cancellation {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!("Load of `{}` cancelled", resource_id);
                    Err(classify(resource_id, Failure::Cancelled))
                }
                result = load => result,
            },
            None => load.await,
        };

        let tag = match &result {
            Ok(result) => result.cache_status().as_str(),
            Err(err) => err.kind().as_str(),
        };
        metric!(counter("loader.load") += 1, "result" => tag);

        result
    }

    async fn load_inner(
        &self,
        resource_id: &ResourceId,
        options: LoadOptions,
    ) -> Result<LoadResult, LoadError> {
        let skip_cache = options.skip_cache || self.dev_mode;
        let cached = self.cached_entry(resource_id);

        if let Some(entry) = &cached {
            if !skip_cache {
                if self.store.is_fresh(entry, SystemTime::now()) {
                    tracing::trace!("Serving fresh config `{}` from cache", resource_id);
                    return Ok(LoadResult::cached(entry, false));
                }

                let swr = options
                    .stale_while_revalidate
                    .unwrap_or(self.policy.stale_while_revalidate);
                if swr {
                    tracing::trace!("Serving stale config `{}`, revalidating", resource_id);
                    self.spawn_revalidation(Arc::clone(entry), options.cache_ttl_override);
                    return Ok(LoadResult::cached(entry, true));
                }
            }
        }

        let (shared, _) = self.in_flight.run(resource_id, || {
            self.clone()
                .revalidate(resource_id.clone(), cached.clone(), options.cache_ttl_override)
        });

        match (shared.await, cached) {
            (Err(err), Some(entry))
                if err.kind() == ErrorKind::NetworkError && self.policy.stale_fallback =>
            {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Upstream unreachable, serving cached config `{}`",
                    resource_id
                );
                let stale = !entry.is_fresh(SystemTime::now());
                Ok(LoadResult::cached(&entry, stale))
            }
            (result, _) => result,
        }
    }

    /// Asks the upstream about `resource_id` and updates the store with the answer.
    async fn revalidate(
        self,
        resource_id: ResourceId,
        cached: Option<Arc<CacheEntry>>,
        ttl_override: Option<Duration>,
    ) -> Result<LoadResult, LoadError> {
        let known_etag = cached.as_ref().and_then(|entry| entry.etag.as_deref());
        let fetch = self.source.fetch(&resource_id, known_etag);
        let outcome = match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(outcome) => outcome,
            Err(_) => FetchOutcome::TransportFailure {
                cause: TransportError::Timeout(self.fetch_timeout),
            },
        };
        metric!(counter("loader.fetch") += 1, "outcome" => outcome.metrics_tag());

        let failure = match outcome {
            FetchOutcome::Updated {
                payload,
                etag,
                max_age,
            } => {
                if let Err(err) = self.validator.validate(&payload) {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "Discarding invalid config `{}`",
                        resource_id
                    );
                    return Err(classify(&resource_id, Failure::Invalid(err)));
                }

                let max_age = max_age.filter(|_| self.policy.respect_cache_control);
                let ttl = ttl_override
                    .or(max_age)
                    .unwrap_or(self.policy.default_ttl);
                let entry = CacheEntry::new(resource_id.clone(), payload, etag, ttl);
                let result = LoadResult::fetched(&entry);

                if let Err(err) = self.store.put(entry) {
                    log_cache_error("write", &resource_id, &err);
                }
                return Ok(result);
            }
            FetchOutcome::NotModified => {
                let Some(cached) = cached else {
                    return Err(classify(&resource_id, Failure::UnexpectedNotModified));
                };

                let ttl = ttl_override.unwrap_or(cached.ttl);
                let (stored, result) = self.store.touch(&cached, ttl);
                if let Err(err) = result {
                    log_cache_error("write", &resource_id, &err);
                }
                return Ok(LoadResult::cached(&stored, false));
            }
            FetchOutcome::NotFound => Failure::NotFound,
            FetchOutcome::Forbidden => Failure::Forbidden,
            FetchOutcome::TransportFailure { cause } => Failure::Transport(cause),
            FetchOutcome::Malformed { details } => {
                Failure::Invalid(ValidationError::Malformed(details))
            }
        };

        Err(classify(&resource_id, failure))
    }

    /// Revalidates `entry` without anyone waiting for it.
    ///
    /// Nothing is scheduled if the resource is being fetched already, or if too many background
    /// revalidations are running.
    fn spawn_revalidation(&self, entry: Arc<CacheEntry>, ttl_override: Option<Duration>) {
        let resource_id = entry.resource_id.clone();
        if self.in_flight.is_in_flight(&resource_id) {
            return;
        }

        // We count down towards zero, and if we reach or surpass it, we will stop here.
        if self.revalidation_budget.fetch_sub(1, Ordering::Relaxed) <= 0 {
            self.revalidation_budget.fetch_add(1, Ordering::Relaxed);
            metric!(counter("loader.revalidation.limit_hit") += 1);
            tracing::debug!("Revalidation limit hit, not revalidating `{}`", resource_id);
            return;
        }

        let done_token = {
            let budget = Arc::clone(&self.revalidation_budget);
            CallOnDrop::new(move || {
                budget.fetch_add(1, Ordering::Relaxed);
            })
        };

        let (shared, _) = self.in_flight.run(&resource_id, || {
            self.clone()
                .revalidate(resource_id.clone(), Some(entry), ttl_override)
        });

        let events = self.events.clone();
        let task = async move {
            let _done_token = done_token; // move into the future

            let result = shared.await;
            match &result {
                Ok(_) => tracing::debug!("Revalidated config `{}`", resource_id),
                Err(err) => tracing::debug!(
                    error = err as &dyn std::error::Error,
                    "Background revalidation failed",
                ),
            }
            // there might be nobody listening
            let _ = events.send(RevalidationEvent {
                resource_id,
                result,
            });
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// Loads `resource_id` into the cache, unless it is cached and fresh already.
    pub async fn preload(&self, resource_id: &ResourceId) -> Result<(), LoadError> {
        let options = LoadOptions {
            stale_while_revalidate: Some(false),
            ..Default::default()
        };
        self.load(resource_id, options).await.map(|_| ())
    }

    /// Removes the cached entry for `resource_id`, or all entries if `None`.
    pub fn clear_cache(&self, resource_id: Option<&ResourceId>) -> Result<(), CacheError> {
        self.store.invalidate(resource_id)
    }

    /// Whether an entry for `resource_id` is cached, fresh or not.
    pub fn is_cached(&self, resource_id: &ResourceId) -> bool {
        self.cached_entry(resource_id).is_some()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Registers for [`RevalidationEvent`]s of background revalidations.
    pub fn subscribe(&self) -> broadcast::Receiver<RevalidationEvent> {
        self.events.subscribe()
    }

    /// Reads the cached entry, treating a broken one as absent.
    fn cached_entry(&self, resource_id: &ResourceId) -> Option<Arc<CacheEntry>> {
        match self.store.get(resource_id) {
            Ok(entry) => entry,
            Err(err) => {
                log_cache_error("read", resource_id, &err);
                None
            }
        }
    }
}

fn log_cache_error(op: &'static str, resource_id: &ResourceId, err: &CacheError) {
    metric!(counter("cache.error") += 1, "op" => op, "error" => err.metrics_tag());
    tracing::error!(
        error = err as &dyn std::error::Error,
        "Failed to {} cached config `{}`",
        op,
        resource_id
    );
}
