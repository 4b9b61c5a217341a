//! Cache layer that memoizes read requests and collapses concurrent duplicates.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::retry::{with_retry, RetryPolicy};
use super::traits::{CacheResult, CacheSource, QueryKey};
use crate::clock::Clock;
use crate::error::FetchError;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

struct CacheEntry<V> {
  value: V,
  fetched_at: DateTime<Utc>,
}

struct InFlight<V> {
  fetch: SharedFetch<V>,
}

struct CacheState<V> {
  entries: HashMap<String, CacheEntry<V>>,
  in_flight: HashMap<String, InFlight<V>>,
  /// Bumped on every invalidation; results of calls started in an older
  /// epoch are returned to their callers but not stored.
  epoch: u64,
}

/// Request cache shared by every reader for the engine's lifetime.
///
/// Holds at most one outstanding call per key; callers arriving while a call
/// is in flight attach to it and receive a clone of its result.
pub struct CacheLayer<V> {
  state: Arc<Mutex<CacheState<V>>>,
  clock: Arc<dyn Clock>,
  /// Entries older than this are never served
  ttl: Duration,
  backoff: std::time::Duration,
}

impl<V> CacheLayer<V>
where
  V: Clone + Send + Sync + 'static,
{
  /// Create a new cache layer reading time from `clock`.
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self {
      state: Arc::new(Mutex::new(CacheState {
        entries: HashMap::new(),
        in_flight: HashMap::new(),
        epoch: 0,
      })),
      clock,
      ttl: Duration::seconds(30),
      backoff: RetryPolicy::default().backoff,
    }
  }

  /// Set the time-to-live for stored entries.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Set the wait between retry attempts.
  pub fn with_backoff(mut self, backoff: std::time::Duration) -> Self {
    self.backoff = backoff;
    self
  }

  fn is_expired(&self, fetched_at: DateTime<Utc>) -> bool {
    self.clock.now() - fetched_at > self.ttl
  }

  /// Fetch through the cache.
  ///
  /// 1. With `use_cache` and a fresh entry, return a copy of it
  /// 2. If a call for the same key is in flight, await its result
  /// 3. Otherwise run `loader` (retrying transport and 5xx failures up to
  ///    `retries` times) and, with `use_cache`, store the result
  pub async fn request<K, F, Fut>(
    &self,
    key: &K,
    loader: F,
    use_cache: bool,
    retries: u32,
  ) -> Result<CacheResult<V>, FetchError>
  where
    K: QueryKey + ?Sized,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let cache_key = key.cache_key();

    let (fetch, source) = {
      let mut state = lock(&self.state);

      if use_cache {
        let expired = match state.entries.get(&cache_key) {
          Some(entry) if !self.is_expired(entry.fetched_at) => {
            debug!("cache hit: {}", key.description());
            return Ok(CacheResult::from_cache(
              entry.value.clone(),
              entry.fetched_at,
            ));
          }
          Some(_) => true,
          None => false,
        };
        if expired {
          state.entries.remove(&cache_key);
        }
      }

      if let Some(in_flight) = state.in_flight.get(&cache_key) {
        debug!("joining in-flight request: {}", key.description());
        (in_flight.fetch.clone(), CacheSource::Shared)
      } else {
        let policy = RetryPolicy {
          retries,
          backoff: self.backoff,
        };
        let fetch = self.start_fetch(
          cache_key.clone(),
          key.description(),
          state.epoch,
          loader,
          use_cache,
          policy,
        );
        state.in_flight.insert(
          cache_key,
          InFlight {
            fetch: fetch.clone(),
          },
        );
        (fetch, CacheSource::Network)
      }
    };

    let data = fetch.await?;
    Ok(match source {
      CacheSource::Shared => CacheResult::shared(data),
      _ => CacheResult::from_network(data),
    })
  }

  /// Build the shared future for one network call.
  ///
  /// Bookkeeping runs inside the future so it completes no matter which
  /// attached caller ends up driving it.
  fn start_fetch<F, Fut>(
    &self,
    cache_key: String,
    description: String,
    epoch: u64,
    loader: F,
    use_cache: bool,
    policy: RetryPolicy,
  ) -> SharedFetch<V>
  where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let state = Arc::clone(&self.state);
    let clock = Arc::clone(&self.clock);

    async move {
      debug!("fetching: {}", description);
      let result = with_retry(&description, policy, loader).await;

      let mut state = lock(&state);
      state.in_flight.remove(&cache_key);
      if let Ok(value) = &result {
        if use_cache && state.epoch == epoch {
          state.entries.insert(
            cache_key,
            CacheEntry {
              value: value.clone(),
              fetched_at: clock.now(),
            },
          );
        }
      }
      result
    }
    .boxed()
    .shared()
  }

  /// Remove every entry whose key contains `pattern`. Returns the number removed.
  pub fn invalidate(&self, pattern: &str) -> usize {
    let mut state = lock(&self.state);
    state.epoch += 1;
    let before = state.entries.len();
    state.entries.retain(|key, _| !key.contains(pattern));
    let removed = before - state.entries.len();
    debug!("invalidated {} cache entries matching {:?}", removed, pattern);
    removed
  }

  /// Remove every entry.
  pub fn invalidate_all(&self) {
    let mut state = lock(&self.state);
    state.epoch += 1;
    state.entries.clear();
    debug!("invalidated all cache entries");
  }
}

impl<V> Clone for CacheLayer<V> {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
      clock: Arc::clone(&self.clock),
      ttl: self.ttl,
      backoff: self.backoff,
    }
  }
}

fn lock<V>(state: &Mutex<CacheState<V>>) -> MutexGuard<'_, CacheState<V>> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn layer(clock: &Arc<ManualClock>) -> CacheLayer<String> {
    CacheLayer::new(clock.clone() as Arc<dyn Clock>)
  }

  fn loader(
    calls: Arc<AtomicU32>,
    delay_ms: u64,
  ) -> impl Fn() -> BoxFuture<'static, Result<String, FetchError>> + Send + 'static {
    move || {
      let calls = calls.clone();
      async move {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        Ok(format!("body-{}", n))
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_share_one_call() {
    let clock = Arc::new(ManualClock::new());
    let cache = layer(&clock);
    let calls = Arc::new(AtomicU32::new(0));

    let (a, b) = tokio::join!(
      cache.request("billing?email=a@b.com", loader(calls.clone(), 100), true, 2),
      cache.request("billing?email=a@b.com", loader(calls.clone(), 100), true, 2),
    );

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data, "body-1");
    assert_eq!(b.data, "body-1");
    assert_eq!(a.source, CacheSource::Network);
    assert_eq!(b.source, CacheSource::Shared);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dedup_applies_without_cache() {
    let clock = Arc::new(ManualClock::new());
    let cache = layer(&clock);
    let calls = Arc::new(AtomicU32::new(0));

    let (a, b) = tokio::join!(
      cache.request("licenses?email=a@b.com", loader(calls.clone(), 50), false, 0),
      cache.request("licenses?email=a@b.com", loader(calls.clone(), 50), false, 0),
    );

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Nothing stored, so the next read goes out again
    cache
      .request("licenses?email=a@b.com", loader(calls.clone(), 0), true, 0)
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_ttl_boundary() {
    let clock = Arc::new(ManualClock::new());
    let cache = layer(&clock);
    let calls = Arc::new(AtomicU32::new(0));
    let key = "billing?email=a@b.com";

    cache.request(key, loader(calls.clone(), 0), true, 0).await.unwrap();

    clock.advance(Duration::seconds(30) - Duration::milliseconds(1));
    let hit = cache.request(key, loader(calls.clone(), 0), true, 0).await.unwrap();
    assert_eq!(hit.source, CacheSource::Cache);
    assert_eq!(hit.data, "body-1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::milliseconds(2));
    let miss = cache.request(key, loader(calls.clone(), 0), true, 0).await.unwrap();
    assert_eq!(miss.source, CacheSource::Network);
    assert_eq!(miss.data, "body-2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_by_substring() {
    let clock = Arc::new(ManualClock::new());
    let cache = layer(&clock);
    let calls = Arc::new(AtomicU32::new(0));

    cache.request("billing?email=a", loader(calls.clone(), 0), true, 0).await.unwrap();
    cache.request("licenses?email=a", loader(calls.clone(), 0), true, 0).await.unwrap();

    assert_eq!(cache.invalidate("billing?"), 1);

    let billing = cache.request("billing?email=a", loader(calls.clone(), 0), true, 0).await.unwrap();
    let licenses = cache.request("licenses?email=a", loader(calls.clone(), 0), true, 0).await.unwrap();
    assert_eq!(billing.source, CacheSource::Network);
    assert_eq!(licenses.source, CacheSource::Cache);

    cache.invalidate_all();
    let licenses = cache.request("licenses?email=a", loader(calls.clone(), 0), true, 0).await.unwrap();
    assert_eq!(licenses.source, CacheSource::Network);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failures_are_not_cached() {
    let clock = Arc::new(ManualClock::new());
    let cache = layer(&clock);
    let calls = Arc::new(AtomicU32::new(0));
    let failing = {
      let calls = calls.clone();
      move || {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Err::<String, _>(FetchError::from_status(404, b"no such user"))
        }
      }
    };

    let err = cache.request("billing?email=x", failing, true, 2).await.unwrap_err();
    assert!(matches!(err, FetchError::Client { status: 404, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let ok = cache.request("billing?email=x", loader(calls.clone(), 0), true, 2).await.unwrap();
    assert_eq!(ok.source, CacheSource::Network);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_during_flight_skips_store() {
    let clock = Arc::new(ManualClock::new());
    let cache = layer(&clock);
    let calls = Arc::new(AtomicU32::new(0));

    let pending = cache.request("billing?email=a", loader(calls.clone(), 100), true, 0);
    let invalidate = async {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
      cache.invalidate("billing?");
    };
    let (result, _) = tokio::join!(pending, invalidate);
    assert_eq!(result.unwrap().data, "body-1");

    let again = cache.request("billing?email=a", loader(calls.clone(), 0), true, 0).await.unwrap();
    assert_eq!(again.source, CacheSource::Network);
    assert_eq!(again.data, "body-2");
  }
}
