//! # Result Cache
//!
//! TTL-keyed memoization of `(operation identity, arguments) -> result` with
//! single-flight coalescing: at most one concurrent execution of the producer
//! per key. Callers that find a build in flight subscribe to its outcome
//! instead of executing their own.
//!
//! Expiry is lazy — checked at lookup, no background sweep — and failures are
//! never cached: a failed build propagates to every waiter and leaves no
//! entry behind.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{codes, TaskFailure};

/// Outcome of a cache lookup or build.
pub type CacheResult = Result<Value, TaskFailure>;

/// Hash of (operation identity, canonicalized params).
///
/// Param keys are hashed in sorted order so maps that are equal as mappings
/// produce the same key regardless of insertion order.
pub fn cache_key(operation_id: &str, params: &Map<String, Value>) -> u64 {
    let mut hasher = DefaultHasher::new();
    operation_id.hash(&mut hasher);
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    for key in keys {
        key.hash(&mut hasher);
        // Value is not Hash; its JSON text is stable for a given value
        params[key].to_string().hash(&mut hasher);
    }
    hasher.finish()
}

enum Slot {
    /// A completed build, valid until `expires_at`
    Ready { value: Value, expires_at: Instant },
    /// A build in flight; waiters subscribe to the channel
    InFlight { tx: broadcast::Sender<CacheResult> },
}

/// TTL result cache with at-most-one concurrent build per key.
///
/// ```rust
/// use dispatch_core::cache::ResultCache;
/// use serde_json::{json, Map};
/// use std::time::Duration;
///
/// let cache = ResultCache::new();
/// let mut params = Map::new();
/// params.insert("q".to_string(), json!("rust"));
///
/// let value = tokio_test::block_on(cache.get_or_compute(
///     "search",
///     &params,
///     Duration::from_secs(60),
///     || async { Ok(json!(["hit"])) },
/// ))?;
/// assert_eq!(value, json!(["hit"]));
/// # Ok::<(), dispatch_core::TaskFailure>(())
/// ```
#[derive(Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<u64, Slot>>,
}

/// Removes an in-flight slot if the builder unwinds before publishing,
/// closing the channel so waiters fail instead of hanging.
struct InFlightGuard<'a> {
    cache: &'a ResultCache,
    key: u64,
    defused: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.defused {
            warn!(key = self.key, "cache producer dropped without publishing");
            self.cache.entries.lock().remove(&self.key);
        }
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the value for `(operation_id, params)`, executing `producer`
    /// on a miss.
    ///
    /// Concurrent callers for the same absent or expired key coalesce behind
    /// the single in-flight producer and all receive its result. A
    /// successful value is stored with `expires_at = now + ttl`; failures
    /// are not stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        operation_id: &str,
        params: &Map<String, Value>,
        ttl: Duration,
        producer: F,
    ) -> CacheResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult>,
    {
        let key = cache_key(operation_id, params);

        let waiter = {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some(Slot::Ready { value, expires_at }) if *expires_at > Instant::now() => {
                    debug!(operation_id = %operation_id, key = key, "cache hit");
                    return Ok(value.clone());
                }
                Some(Slot::InFlight { tx }) => Some(tx.subscribe()),
                // Miss or lazily observed expiry: this caller becomes the builder
                _ => {
                    let (tx, _) = broadcast::channel(1);
                    entries.insert(key, Slot::InFlight { tx });
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            debug!(operation_id = %operation_id, key = key, "coalescing behind in-flight build");
            return match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(TaskFailure::new(
                    codes::CACHE_WAIT_FAILED,
                    format!("in-flight build for '{operation_id}' ended without a result"),
                )),
            };
        }

        let mut guard = InFlightGuard {
            cache: self,
            key,
            defused: false,
        };

        let result = producer().await;

        let tx = {
            let mut entries = self.entries.lock();
            guard.defused = true;
            let previous = match &result {
                Ok(value) => entries.insert(
                    key,
                    Slot::Ready {
                        value: value.clone(),
                        expires_at: Instant::now() + ttl,
                    },
                ),
                Err(_) => entries.remove(&key),
            };
            match previous {
                Some(Slot::InFlight { tx }) => Some(tx),
                _ => None,
            }
        };

        if let Some(tx) = tx {
            // Waiters may have all dropped; a send error is fine
            let _ = tx.send(result.clone());
        }

        result
    }

    /// Drop the completed entry for `(operation_id, params)`, if any.
    ///
    /// An in-flight build is left untouched: removing it would close the
    /// waiters' channel and allow a second concurrent build of the same key.
    /// Its result lands normally and can be invalidated afterwards.
    pub fn invalidate(&self, operation_id: &str, params: &Map<String, Value>) {
        let key = cache_key(operation_id, params);
        let mut entries = self.entries.lock();
        if let Some(Slot::Ready { .. }) = entries.get(&key) {
            entries.remove(&key);
        }
    }

    /// Remove every expired entry. Expiry is otherwise lazy; this is a
    /// maintenance helper for long-lived caches.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::InFlight { .. } => true,
        });
        before - entries.len()
    }

    /// Number of entries currently held, including in-flight builds.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn computes_on_miss_and_hits_within_ttl() {
        let cache = ResultCache::new();
        let runs = AtomicUsize::new(0);
        let p = params(&[("q", json!("rust"))]);

        for _ in 0..3 {
            let result = cache
                .get_or_compute("search", &p, Duration::from_secs(60), || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!(["hit"])) }
                })
                .await;
            assert_eq!(result.unwrap(), json!(["hit"]));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_a_miss() {
        let cache = ResultCache::new();
        let runs = AtomicUsize::new(0);
        let p = params(&[("q", json!("rust"))]);

        for _ in 0..2 {
            let _ = cache
                .get_or_compute("search", &p, Duration::from_millis(20), || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!(1)) }
                })
                .await;
            sleep(Duration::from_millis(40)).await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_into_one_execution() {
        let cache = Arc::new(ResultCache::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let p = params(&[("id", json!(7))]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let runs = runs.clone();
            let p = p.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("lookup", &p, Duration::from_secs(60), || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        async {
                            // Hold the build long enough for every caller to arrive
                            sleep(Duration::from_millis(50)).await;
                            Ok(json!("value"))
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.expect("join");
            assert_eq!(result.unwrap(), json!("value"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_propagate_to_waiters_and_are_not_cached() {
        let cache = Arc::new(ResultCache::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let p = params(&[("id", json!(1))]);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let runs = runs.clone();
            let p = p.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("flaky", &p, Duration::from_secs(60), || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        async {
                            sleep(Duration::from_millis(30)).await;
                            Err(TaskFailure::new("FLAKY", "boom"))
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.expect("join");
            assert_eq!(result.unwrap_err().code, "FLAKY");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // No entry left behind: the next call executes again
        assert!(cache.is_empty());
        let result = cache
            .get_or_compute("flaky", &p, Duration::from_secs(60), || async {
                Ok(json!("recovered"))
            })
            .await;
        assert_eq!(result.unwrap(), json!("recovered"));
    }

    #[tokio::test]
    async fn key_is_insensitive_to_param_order() {
        let mut a = Map::new();
        a.insert("x".to_string(), json!(1));
        a.insert("y".to_string(), json!(2));
        let mut b = Map::new();
        b.insert("y".to_string(), json!(2));
        b.insert("x".to_string(), json!(1));

        assert_eq!(cache_key("op", &a), cache_key("op", &b));
        assert_ne!(cache_key("op", &a), cache_key("other", &a));
    }

    #[tokio::test]
    async fn invalidate_forces_recompute() {
        let cache = ResultCache::new();
        let runs = AtomicUsize::new(0);
        let p = params(&[("q", json!("x"))]);

        for _ in 0..2 {
            let _ = cache
                .get_or_compute("search", &p, Duration::from_secs(60), || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!(null)) }
                })
                .await;
            cache.invalidate("search", &p);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_leaves_in_flight_builds_untouched() {
        let cache = Arc::new(ResultCache::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let p = params(&[("id", json!(3))]);

        let builder = {
            let cache = cache.clone();
            let runs = runs.clone();
            let p = p.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("lookup", &p, Duration::from_secs(60), || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        async {
                            sleep(Duration::from_millis(50)).await;
                            Ok(json!("built"))
                        }
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        // A waiter coalesced behind the build must survive the invalidation
        let waiter = {
            let cache = cache.clone();
            let runs = runs.clone();
            let p = p.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("lookup", &p, Duration::from_secs(60), || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        async { Ok(json!("second build")) }
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;
        cache.invalidate("lookup", &p);

        assert_eq!(builder.await.expect("join").unwrap(), json!("built"));
        assert_eq!(waiter.await.expect("join").unwrap(), json!("built"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // The completed value was stored despite the mid-flight invalidate
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn purge_expired_removes_only_stale_entries() {
        let cache = ResultCache::new();
        let short = params(&[("k", json!("short"))]);
        let long = params(&[("k", json!("long"))]);

        let _ = cache
            .get_or_compute("op", &short, Duration::from_millis(10), || async {
                Ok(json!(1))
            })
            .await;
        let _ = cache
            .get_or_compute("op", &long, Duration::from_secs(60), || async {
                Ok(json!(2))
            })
            .await;

        sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
