//! Cache layer that runs the caching strategies against the network.

use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::storage::CacheStore;
use super::traits::{CacheResult, Generation, RequestKey};
use crate::error::Result;
use crate::http::{Request, Response};
use crate::network::Network;
use crate::router::Strategy;

/// Strategy executor sitting between intercepted requests and the network.
///
/// Lookups match across both namespaces of the current generation. Writes
/// go to the static namespace for cache-first and to the dynamic namespace
/// otherwise. Only `200` responses are ever written.
pub struct CacheLayer<S: CacheStore, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  generation: Generation,
  /// In-flight stale-while-revalidate refreshes
  revalidations: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStore + 'static, N: Network> CacheLayer<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, generation: Generation) -> Self {
    Self {
      storage,
      network,
      generation,
      revalidations: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  pub async fn execute(
    &self,
    strategy: Strategy,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    match strategy {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// Serve from cache; fetch and store in the static namespace on a miss.
  pub async fn cache_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    let key = RequestKey::from_request(request);

    if let Some(entry) = self.storage.lookup(&self.generation, &key)? {
      debug!(key = %key, "cache-first hit");
      return Ok(CacheResult::from_cache(entry.response, entry.inserted_at));
    }

    // Miss, must fetch from network
    let response = self.network.fetch(request.clone()).await?;
    if response.is_cacheable() {
      self
        .storage
        .put(&self.generation.static_ns, &key, &response)?;
    }
    Ok(CacheResult::from_network(response))
  }

  /// Prefer the network; fall back to the cache when the network fails.
  ///
  /// A response with an error status is returned as-is and never stored.
  pub async fn network_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    let key = RequestKey::from_request(request);

    match self.network.fetch(request.clone()).await {
      Ok(response) => {
        if response.is_cacheable() {
          self
            .storage
            .put(&self.generation.dynamic_ns, &key, &response)?;
        } else {
          debug!(key = %key, status = response.status, "not caching upstream status");
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(key = %key, error = %e, "network-first fetch failed, trying cache");
        match self.storage.lookup(&self.generation, &key)? {
          Some(entry) => Ok(CacheResult::offline(entry.response, entry.inserted_at)),
          None => Err(e.into()),
        }
      }
    }
  }

  /// Serve a cached copy immediately and refresh it in the background.
  ///
  /// Without a cached copy the caller waits on the network. Failures of the
  /// background refresh are logged and dropped.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<CacheResult<Response>> {
    let key = RequestKey::from_request(request);

    if let Some(entry) = self.storage.lookup(&self.generation, &key)? {
      self.spawn_revalidation(request.clone(), key);
      return Ok(CacheResult::from_cache(entry.response, entry.inserted_at));
    }

    let response = self.network.fetch(request.clone()).await?;
    if response.is_cacheable() {
      self
        .storage
        .put(&self.generation.dynamic_ns, &key, &response)?;
    }
    Ok(CacheResult::from_network(response))
  }

  fn spawn_revalidation(&self, request: Request, key: RequestKey) {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let namespace = self.generation.dynamic_ns.clone();

    let task = async move {
      match network.fetch(request).await {
        Ok(response) if response.is_cacheable() => {
          if let Err(e) = storage.put(&namespace, &key, &response) {
            debug!(key = %key, error = %e, "revalidation store failed");
          }
        }
        Ok(response) => {
          debug!(key = %key, status = response.status, "revalidation returned uncacheable status");
        }
        Err(e) => {
          debug!(key = %key, error = %e, "background revalidation failed");
        }
      }
    };

    match self.revalidations.lock() {
      Ok(mut set) => {
        // Reap finished refreshes so the set doesn't grow unbounded
        while set.try_join_next().is_some() {}
        set.spawn(task);
      }
      Err(_) => {
        tokio::spawn(task);
      }
    }
  }

  /// Wait for every in-flight background refresh to finish.
  pub async fn settle(&self) {
    let mut set = match self.revalidations.lock() {
      Ok(mut guard) => std::mem::replace(&mut *guard, JoinSet::new()),
      Err(_) => return,
    };

    while let Some(result) = set.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "revalidation task aborted");
      }
    }
  }
}

impl<S: CacheStore, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      generation: self.generation.clone(),
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::traits::{CacheEntry, CacheNamespace, CacheSource};
  use crate::error::Error;
  use crate::testing::MockNetwork;

  fn layer(network: &Arc<MockNetwork>) -> CacheLayer<SqliteStorage, MockNetwork> {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    CacheLayer::new(storage, Arc::clone(network), Generation::new("stride", 1))
  }

  fn cached(layer: &CacheLayer<SqliteStorage, MockNetwork>, path: &str) -> Option<Response> {
    let key = RequestKey::from_request(&Request::get(path));
    layer
      .storage()
      .lookup(layer.generation(), &key)
      .unwrap()
      .map(|entry| entry.response)
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let network = MockNetwork::new();
    network.respond("/static/css/style.css", Response::new(200, "body{}"));
    let layer = layer(&network);

    let first = layer.cache_first(&Request::get("/static/css/style.css")).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    network.respond("/static/css/style.css", Response::new(200, "changed"));
    for _ in 0..3 {
      let hit = layer.cache_first(&Request::get("/static/css/style.css")).await.unwrap();
      assert_eq!(hit.source, CacheSource::Cache);
      assert_eq!(hit.data.body.as_ref(), b"body{}");
    }
    assert_eq!(network.call_count("/static/css/style.css"), 1);
  }

  #[tokio::test]
  async fn test_cache_first_stores_in_static_namespace() {
    let network = MockNetwork::new();
    network.respond("/static/js/app.js", Response::new(200, "js"));
    let layer = layer(&network);

    layer.cache_first(&Request::get("/static/js/app.js")).await.unwrap();

    let key = RequestKey::from_request(&Request::get("/static/js/app.js"));
    let generation = layer.generation().clone();
    assert!(layer.storage().get(&generation.static_ns, &key).unwrap().is_some());
    assert!(layer.storage().get(&generation.dynamic_ns, &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_fails_when_cache_and_network_fail() {
    let network = MockNetwork::new();
    network.set_online(false);
    let layer = layer(&network);

    let err = layer.cache_first(&Request::get("/static/js/app.js")).await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));
  }

  #[tokio::test]
  async fn test_network_first_caches_200_for_offline_use() {
    let network = MockNetwork::new();
    network.respond("/api/rankings", Response::new(200, "[1,2,3]"));
    let layer = layer(&network);

    let live = layer.network_first(&Request::get("/api/rankings")).await.unwrap();
    assert_eq!(live.source, CacheSource::Network);

    network.set_online(false);
    let offline = layer.cache_first(&Request::get("/api/rankings")).await.unwrap();
    assert_eq!(offline.data.body.as_ref(), b"[1,2,3]");

    let fallback = layer.network_first(&Request::get("/api/rankings")).await.unwrap();
    assert_eq!(fallback.source, CacheSource::Offline);
    assert_eq!(fallback.data.body.as_ref(), b"[1,2,3]");
  }

  #[tokio::test]
  async fn test_network_first_never_stores_non_200() {
    let network = MockNetwork::new();
    let layer = layer(&network);

    for (path, status) in [("/api/a", 201), ("/api/b", 302), ("/api/c", 404), ("/api/d", 500)] {
      network.respond(path, Response::new(status, "error page"));
      let result = layer.network_first(&Request::get(path)).await.unwrap();
      assert_eq!(result.data.status, status);
      assert!(cached(&layer, path).is_none(), "{} was cached", status);
    }
  }

  #[tokio::test]
  async fn test_network_first_error_status_does_not_fall_back() {
    let network = MockNetwork::new();
    network.respond("/api/rankings", Response::new(200, "good"));
    let layer = layer(&network);
    layer.network_first(&Request::get("/api/rankings")).await.unwrap();

    network.respond("/api/rankings", Response::new(503, "upstream down"));
    let result = layer.network_first(&Request::get("/api/rankings")).await.unwrap();
    assert_eq!(result.data.status, 503);
    assert_eq!(cached(&layer, "/api/rankings").unwrap().body.as_ref(), b"good");
  }

  #[tokio::test]
  async fn test_network_first_miss_while_offline_fails_upward() {
    let network = MockNetwork::new();
    network.set_online(false);
    let layer = layer(&network);

    let err = layer.network_first(&Request::get("/api/rankings")).await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));
  }

  #[tokio::test]
  async fn test_swr_serves_cached_without_waiting_then_refreshes() {
    let network = MockNetwork::new();
    network.respond("/api/weather", Response::new(200, "stale"));
    let layer = layer(&network);
    layer.stale_while_revalidate(&Request::get("/api/weather")).await.unwrap();

    // Network now hangs; a cached answer must still come back
    network.respond("/api/weather", Response::new(200, "fresh"));
    network.hold();
    let served = layer.stale_while_revalidate(&Request::get("/api/weather")).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.data.body.as_ref(), b"stale");

    network.release();
    layer.settle().await;

    let next = layer.stale_while_revalidate(&Request::get("/api/weather")).await.unwrap();
    assert_eq!(next.data.body.as_ref(), b"fresh");
    layer.settle().await;
  }

  #[tokio::test]
  async fn test_swr_without_cache_waits_on_network() {
    let network = MockNetwork::new();
    network.respond("/api/weather", Response::new(200, "live"));
    let layer = layer(&network);

    let result = layer.stale_while_revalidate(&Request::get("/api/weather")).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(cached(&layer, "/api/weather").unwrap().body.as_ref(), b"live");
  }

  #[tokio::test]
  async fn test_swr_background_failure_is_swallowed() {
    let network = MockNetwork::new();
    network.respond("/api/weather", Response::new(200, "cached"));
    let layer = layer(&network);
    layer.stale_while_revalidate(&Request::get("/api/weather")).await.unwrap();

    network.fail_path("/api/weather");
    let served = layer.stale_while_revalidate(&Request::get("/api/weather")).await.unwrap();
    assert_eq!(served.data.body.as_ref(), b"cached");
    layer.settle().await;

    network.heal_path("/api/weather");
    network.respond("/api/weather", Response::new(500, "broken"));
    layer.stale_while_revalidate(&Request::get("/api/weather")).await.unwrap();
    layer.settle().await;

    assert_eq!(cached(&layer, "/api/weather").unwrap().body.as_ref(), b"cached");
  }

  struct BrokenStorage;

  impl CacheStore for BrokenStorage {
    fn get(&self, _ns: &CacheNamespace, _key: &RequestKey) -> Result<Option<CacheEntry>> {
      Err(Error::Storage("quota exceeded".to_string()))
    }

    fn put(&self, _ns: &CacheNamespace, _key: &RequestKey, _response: &Response) -> Result<()> {
      Err(Error::Storage("quota exceeded".to_string()))
    }

    fn put_all(&self, _ns: &CacheNamespace, _entries: &[(RequestKey, Response)]) -> Result<()> {
      Err(Error::Storage("quota exceeded".to_string()))
    }

    fn delete_namespace(&self, _ns: &CacheNamespace) -> Result<bool> {
      Err(Error::Storage("quota exceeded".to_string()))
    }

    fn list_namespaces(&self) -> Result<Vec<CacheNamespace>> {
      Err(Error::Storage("quota exceeded".to_string()))
    }
  }

  #[tokio::test]
  async fn test_storage_failure_propagates() {
    let network = MockNetwork::new();
    network.respond("/static/js/app.js", Response::new(200, "js"));
    let layer = CacheLayer::new(
      Arc::new(BrokenStorage),
      Arc::clone(&network),
      Generation::new("stride", 1),
    );

    let err = layer.cache_first(&Request::get("/static/js/app.js")).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
  }
}
