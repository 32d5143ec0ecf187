//! Cache-first request interception with network fallback.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStore, Purpose, Registry};
use crate::origin::{CacheEntry, CacheKey, Fetch, Request, Response};

/// Per-request interception policy.
///
/// Same-origin idempotent reads are served cache-first (static generation,
/// then dynamic) and fall through to a timeout-bounded network fetch on
/// miss. Everything else passes through to the network untouched.
pub struct Interceptor<S: CacheStore, F: Fetch> {
  registry: Arc<Registry<S>>,
  fetcher: Arc<F>,
  origin: Url,
  fallback: Url,
  fetch_timeout: Duration,
  slow_fetch_warn: Duration,
}

impl<S, F> Interceptor<S, F>
where
  S: CacheStore + 'static,
  F: Fetch,
{
  pub fn new(
    registry: Arc<Registry<S>>,
    fetcher: Arc<F>,
    origin: Url,
    offline_fallback: &str,
    fetch_timeout: Duration,
    slow_fetch_warn: Duration,
  ) -> Result<Self> {
    let fallback = origin
      .join(offline_fallback)
      .map_err(|e| eyre!("Invalid offline fallback {}: {}", offline_fallback, e))?;

    Ok(Self {
      registry,
      fetcher,
      origin,
      fallback,
      fetch_timeout,
      slow_fetch_warn,
    })
  }

  fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// Apply the interception policy to one request.
  pub async fn intercept(&self, request: Request) -> Result<Response> {
    // Writes and other non-idempotent methods go straight to the network
    if !request.method.is_idempotent_read() {
      return self.fetcher.fetch(&request).await;
    }

    // So do requests for other origins
    if !self.is_same_origin(&request.url) {
      return self.fetcher.fetch(&request).await;
    }

    let key = request.cache_key();

    // Cache first: static generation, then dynamic
    for purpose in [Purpose::Static, Purpose::Dynamic] {
      if let Some(entry) = self.registry.lookup(purpose, &key)? {
        debug!(url = %request.url, generation = purpose.as_str(), "serving from cache");
        return Ok(entry.into_response());
      }
    }

    match self.fetch_bounded(&request).await {
      Ok(response) => {
        // One copy for the caller, one stored off the request path
        self.store_dynamic(key, &response);
        Ok(response)
      }
      Err(e) => self.degrade(&request, e),
    }
  }

  /// Network fetch bounded by the configured timeout; only a 2xx response
  /// counts as success.
  async fn fetch_bounded(&self, request: &Request) -> Result<Response> {
    let started = Instant::now();

    let response = timeout(self.fetch_timeout, self.fetcher.fetch(request))
      .await
      .map_err(|_| eyre!("Fetch for {} timed out", request.url))??;

    let elapsed = started.elapsed();
    if elapsed > self.slow_fetch_warn {
      warn!(url = %request.url, elapsed_ms = elapsed.as_millis() as u64, "slow origin fetch");
    }

    if !response.is_success() {
      return Err(eyre!(
        "Origin returned {} for {}",
        response.status,
        request.url
      ));
    }

    Ok(response)
  }

  /// Store a copy of the response into the dynamic generation without
  /// blocking the caller's response.
  fn store_dynamic(&self, key: CacheKey, response: &Response) {
    let entry = CacheEntry::from_response(response);
    let registry = Arc::clone(&self.registry);

    tokio::spawn(async move {
      if let Err(e) = registry.put(Purpose::Dynamic, &key, &entry) {
        debug!(url = %key.url, "skipping dynamic cache write: {}", e);
      }
    });
  }

  /// Degraded path after a failed fetch: navigation requests fall back to
  /// the cached root document; anything else propagates the failure.
  fn degrade(&self, request: &Request, cause: color_eyre::Report) -> Result<Response> {
    if request.is_navigation() {
      let fallback_key = CacheKey::get(&self.fallback);
      for purpose in [Purpose::Static, Purpose::Dynamic] {
        if let Some(entry) = self.registry.lookup(purpose, &fallback_key)? {
          warn!(url = %request.url, "network down, serving offline fallback");
          return Ok(entry.into_response());
        }
      }
    }

    Err(cause)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{GenerationId, MemoryCacheStore};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Scripted fetcher: pops the next outcome per call, counts calls.
  struct ScriptedFetcher {
    outcomes: Mutex<Vec<Result<Response>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
  }

  impl ScriptedFetcher {
    fn new(outcomes: Vec<Result<Response>>) -> Self {
      Self {
        outcomes: Mutex::new(outcomes),
        calls: AtomicUsize::new(0),
        delay: None,
      }
    }

    fn slow(outcomes: Vec<Result<Response>>, delay: Duration) -> Self {
      Self {
        delay: Some(delay),
        ..Self::new(outcomes)
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl Fetch for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      let mut outcomes = self.outcomes.lock().unwrap();
      if outcomes.is_empty() {
        return Err(eyre!("unreachable: {}", request.url));
      }
      outcomes.remove(0)
    }
  }

  fn ok(body: &[u8]) -> Result<Response> {
    Ok(Response {
      status: 200,
      headers: Vec::new(),
      body: body.to_vec(),
    })
  }

  fn origin() -> Url {
    Url::parse("https://app.example.com").unwrap()
  }

  fn active_registry() -> Arc<Registry<MemoryCacheStore>> {
    let registry = Registry::new(MemoryCacheStore::new());
    registry
      .activate(
        &GenerationId::new_static("v1"),
        &GenerationId::new_dynamic("v1"),
      )
      .unwrap();
    Arc::new(registry)
  }

  fn interceptor(
    registry: Arc<Registry<MemoryCacheStore>>,
    fetcher: ScriptedFetcher,
  ) -> Interceptor<MemoryCacheStore, ScriptedFetcher> {
    Interceptor::new(
      registry,
      Arc::new(fetcher),
      origin(),
      "/index.html",
      Duration::from_millis(100),
      Duration::from_secs(1),
    )
    .unwrap()
  }

  fn url(path: &str) -> Url {
    origin().join(path).unwrap()
  }

  async fn wait_for_dynamic(
    registry: &Registry<MemoryCacheStore>,
    key: &CacheKey,
  ) -> Option<CacheEntry> {
    // The dynamic write happens on a spawned task; give it a moment
    for _ in 0..50 {
      if let Some(entry) = registry.lookup(Purpose::Dynamic, key).unwrap() {
        return Some(entry);
      }
      tokio::time::sleep(Duration::from_millis(2)).await;
    }
    None
  }

  #[tokio::test]
  async fn cached_entry_wins_over_network() {
    let registry = active_registry();
    let key = CacheKey::get(&url("/app.js"));
    registry
      .put(
        Purpose::Static,
        &key,
        &CacheEntry::from_response(&Response {
          status: 200,
          headers: Vec::new(),
          body: b"cached".to_vec(),
        }),
      )
      .unwrap();

    // The network would return different bytes; it must not be consulted
    let fetcher = ScriptedFetcher::new(vec![ok(b"fresh")]);
    let interceptor = interceptor(Arc::clone(&registry), fetcher);

    let response = interceptor.intercept(Request::get(url("/app.js"))).await.unwrap();
    assert_eq!(response.body, b"cached");
    assert_eq!(interceptor.fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn miss_fetches_and_stores_into_dynamic() {
    let registry = active_registry();
    let fetcher = ScriptedFetcher::new(vec![ok(b"fresh")]);
    let interceptor = interceptor(Arc::clone(&registry), fetcher);

    let response = interceptor.intercept(Request::get(url("/data.json"))).await.unwrap();
    assert_eq!(response.body, b"fresh");

    let key = CacheKey::get(&url("/data.json"));
    let stored = wait_for_dynamic(&registry, &key).await.unwrap();
    assert_eq!(stored.body, b"fresh");
  }

  #[tokio::test]
  async fn non_get_passes_through_untouched() {
    let registry = active_registry();
    let fetcher = ScriptedFetcher::new(vec![ok(b"created")]);
    let interceptor = interceptor(Arc::clone(&registry), fetcher);

    let mut request = Request::get(url("/api/submit"));
    request.method = crate::origin::Method::Post;

    let response = interceptor.intercept(request).await.unwrap();
    assert_eq!(response.body, b"created");
    assert_eq!(interceptor.fetcher.calls(), 1);

    // Nothing cached for a write
    let key = CacheKey {
      method: crate::origin::Method::Post,
      url: url("/api/submit").to_string(),
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(registry.lookup(Purpose::Dynamic, &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn cross_origin_passes_through_untouched() {
    let registry = active_registry();
    let fetcher = ScriptedFetcher::new(vec![ok(b"external")]);
    let interceptor = interceptor(Arc::clone(&registry), fetcher);

    let external = Url::parse("https://cdn.example.net/lib.js").unwrap();
    let response = interceptor.intercept(Request::get(external.clone())).await.unwrap();
    assert_eq!(response.body, b"external");

    tokio::time::sleep(Duration::from_millis(10)).await;
    let key = CacheKey::get(&external);
    assert!(registry.lookup(Purpose::Dynamic, &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn navigation_failure_serves_cached_fallback() {
    let registry = active_registry();
    let fallback_key = CacheKey::get(&url("/index.html"));
    registry
      .put(
        Purpose::Static,
        &fallback_key,
        &CacheEntry::from_response(&Response {
          status: 200,
          headers: Vec::new(),
          body: b"offline page".to_vec(),
        }),
      )
      .unwrap();

    let fetcher = ScriptedFetcher::new(vec![Err(eyre!("connection refused"))]);
    let interceptor = interceptor(Arc::clone(&registry), fetcher);

    let response = interceptor
      .intercept(Request::navigation(url("/some/page")))
      .await
      .unwrap();
    assert_eq!(response.body, b"offline page");
  }

  #[tokio::test]
  async fn non_navigation_failure_propagates() {
    let registry = active_registry();
    let fetcher = ScriptedFetcher::new(vec![Err(eyre!("connection refused"))]);
    let interceptor = interceptor(registry, fetcher);

    let result = interceptor.intercept(Request::get(url("/data.json"))).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn non_success_status_counts_as_failure() {
    let registry = active_registry();
    let fetcher = ScriptedFetcher::new(vec![Ok(Response {
      status: 503,
      headers: Vec::new(),
      body: Vec::new(),
    })]);
    let interceptor = interceptor(Arc::clone(&registry), fetcher);

    let result = interceptor.intercept(Request::get(url("/data.json"))).await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let key = CacheKey::get(&url("/data.json"));
    assert!(registry.lookup(Purpose::Dynamic, &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn hung_fetch_times_out_and_fails() {
    let registry = active_registry();
    // Far beyond the 100ms interceptor timeout
    let fetcher = ScriptedFetcher::slow(vec![ok(b"late")], Duration::from_secs(5));
    let interceptor = interceptor(registry, fetcher);

    let started = Instant::now();
    let result = interceptor.intercept(Request::get(url("/data.json"))).await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(1));
  }

  #[tokio::test]
  async fn timeout_on_navigation_still_falls_back() {
    let registry = active_registry();
    let fallback_key = CacheKey::get(&url("/index.html"));
    registry
      .put(
        Purpose::Static,
        &fallback_key,
        &CacheEntry::from_response(&Response {
          status: 200,
          headers: Vec::new(),
          body: b"offline page".to_vec(),
        }),
      )
      .unwrap();

    let fetcher = ScriptedFetcher::slow(vec![ok(b"late")], Duration::from_secs(5));
    let interceptor = interceptor(registry, fetcher);

    let response = interceptor
      .intercept(Request::navigation(url("/")))
      .await
      .unwrap();
    assert_eq!(response.body, b"offline page");
  }
}
