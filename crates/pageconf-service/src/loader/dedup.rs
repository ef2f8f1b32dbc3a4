use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use crate::caching::ResourceId;
use crate::utils::futures::CallOnDrop;

use super::error::{Failure, LoadError, classify};

/// The eventual result of an in-flight load, awaitable by any number of callers.
pub type SharedLoad<V> = Shared<BoxFuture<'static, Result<V, LoadError>>>;

type InFlightMap<V> = Arc<Mutex<HashMap<ResourceId, SharedLoad<V>>>>;

/// Collapses concurrent loads of the same resource into a single operation.
///
/// The operation runs as a task of its own. Callers merely await its shared result, so a caller
/// that goes away, or even all of them, does not abort it. Its registration is removed once the
/// operation has settled, and the next call for the same resource starts a new one.
pub struct Deduplicator<V> {
    in_flight: InFlightMap<V>,
}

impl<V> std::fmt::Debug for Deduplicator<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self
            .in_flight
            .try_lock()
            .map(|m| m.len())
            .unwrap_or_default();
        f.debug_struct("Deduplicator")
            .field("in-flight loads", &in_flight)
            .finish()
    }
}

impl<V> Clone for Deduplicator<V> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<V> Default for Deduplicator<V> {
    fn default() -> Self {
        Self {
            in_flight: Default::default(),
        }
    }
}

impl<V> Deduplicator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the in-flight load for `resource_id`, or starts one using `make_load`.
    ///
    /// The returned flag is `true` if an already running load was joined, in which case
    /// `make_load` is not called.
    pub fn run<F, Fut>(&self, resource_id: &ResourceId, make_load: F) -> (SharedLoad<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, LoadError>> + Send + 'static,
    {
        // Holding the lock until the registration is inserted. The task only deregisters
        // itself after that.
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(shared) = in_flight.get(resource_id) {
            tracing::trace!("Joining in-flight load of `{}`", resource_id);
            metric!(counter("loader.dedup.joined") += 1);
            return (shared.clone(), true);
        }

        let done_token = {
            let in_flight = Arc::clone(&self.in_flight);
            let resource_id = resource_id.clone();
            CallOnDrop::new(move || {
                in_flight.lock().unwrap().remove(&resource_id);
            })
        };

        let load = make_load();
        let task = async move {
            let _done_token = done_token; // move into the future
            load.await
        };
        let handle = tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        let shared = {
            let resource_id = resource_id.clone();
            async move {
                match handle.await {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Load of `{}` panicked",
                            resource_id
                        );
                        Err(classify(&resource_id, Failure::Task(err)))
                    }
                }
            }
            .boxed()
            .shared()
        };

        in_flight.insert(resource_id.clone(), shared.clone());
        (shared, false)
    }

    /// Whether a load of `resource_id` is currently running.
    pub fn is_in_flight(&self, resource_id: &ResourceId) -> bool {
        self.in_flight.lock().unwrap().contains_key(resource_id)
    }

    /// Number of loads currently running.
    pub fn len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::loader::error::ErrorKind;

    #[tokio::test]
    async fn test_concurrent_runs_share_one_load() {
        let dedup = Deduplicator::<usize>::new();
        let id = ResourceId::new("dashboard-page");
        let started = Arc::new(AtomicUsize::new(0));
        let (release, released) = oneshot::channel::<()>();

        let (first, joined) = dedup.run(&id, || {
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                released.await.ok();
                Ok(42)
            }
        });
        assert!(!joined);

        let mut joiners = Vec::new();
        for _ in 0..9 {
            let (shared, joined) = dedup.run(&id, || async { Ok(0) });
            assert!(joined);
            joiners.push(shared);
        }
        assert!(dedup.is_in_flight(&id));

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 42);
        for shared in joiners {
            assert_eq!(shared.await.unwrap(), 42);
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registration_removed_after_settling() {
        let dedup = Deduplicator::<usize>::new();
        let id = ResourceId::new("dashboard-page");

        let (shared, _) = dedup.run(&id, || async {
            Err(LoadError::new(ErrorKind::NetworkError, "dashboard-page".into()))
        });
        let err = shared.await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);

        // the task deregisters itself right after producing its result
        tokio::task::yield_now().await;
        assert!(dedup.is_empty());

        let (shared, joined) = dedup.run(&id, || async { Ok(1) });
        assert!(!joined);
        assert_eq!(shared.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropping_waiters_does_not_cancel() {
        let dedup = Deduplicator::<usize>::new();
        let id = ResourceId::new("dashboard-page");
        let (done, finished) = oneshot::channel();

        let (shared, _) = dedup.run(&id, || async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.send(()).ok();
            Ok(1)
        });
        drop(shared);

        tokio::time::timeout(Duration::from_secs(5), finished)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_load() {
        let dedup = Deduplicator::<usize>::new();
        let id = ResourceId::new("dashboard-page");

        let panics = true;
        let (shared, _) = dedup.run(&id, move || async move {
            if panics {
                panic!("boom");
            }
            Ok(0)
        });
        let err = shared.await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.resource_id(), &id);

        tokio::task::yield_now().await;
        assert!(!dedup.is_in_flight(&id));
    }
}
