//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;

use super::storage::{is_storable, CacheStorage};
use super::traits::Served;
use crate::net::{Request, Response};

/// Cache layer that applies a caching strategy around a network fetch.
///
/// The fetcher closures perform the real network request; the layer decides
/// whether they run and what happens to their result.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self { storage }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Serve from cache, falling back to the network on a miss.
  ///
  /// 1. Look the request up across all stores - a hit is returned as-is
  /// 2. On a miss, fetch from network (errors propagate)
  /// 3. Write a copy of the response into `store` before returning it
  ///
  /// A failed write is logged and does not affect the response.
  pub async fn cache_first<F, Fut>(
    &self,
    store: &str,
    request: &Request,
    fetcher: F,
  ) -> Result<Served<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    if let Some(cached) = self.storage.match_any(request)? {
      tracing::debug!(url = %request.url, "cache hit");
      return Ok(Served::from_cache(cached.response, cached.cached_at));
    }

    tracing::debug!(url = %request.url, "cache miss, fetching");
    let response = fetcher().await?;

    if is_storable(request, &response) {
      if let Err(e) = self.storage.put(store, request, &response) {
        tracing::warn!(url = %request.url, cache = store, "write-through failed: {:#}", e);
      }
    }

    Ok(Served::from_network(response))
  }

  /// Prefer the network; on network failure serve the cached `fallback`.
  ///
  /// The cache is never written. If the fallback is not cached either, the
  /// original network error is returned; if the lookup itself fails, its error
  /// carries the network error in its context.
  pub async fn network_first<F, Fut>(
    &self,
    request: &Request,
    fallback: &Request,
    fetcher: F,
  ) -> Result<Served<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(err) => {
        // Network failed, serve the cached fallback (offline mode)
        let cached = match self.storage.match_any(fallback) {
          Ok(cached) => cached,
          Err(lookup_err) => {
            return Err(lookup_err.wrap_err(format!(
              "Network request for {} failed ({:#}) and looking up {} failed",
              request.url, err, fallback.url
            )));
          }
        };
        match cached {
          Some(cached) => {
            tracing::warn!(
              url = %request.url,
              fallback = %fallback.url,
              "network failed, serving cached fallback: {:#}",
              err
            );
            Ok(Served::fallback(cached.response, cached.cached_at))
          }
          None => Err(err.wrap_err(format!(
            "Network request for {} failed and {} is not cached",
            request.url, fallback.url
          ))),
        }
      }
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedResponse, ResponseSource, SqliteStorage};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn layer() -> CacheLayer<SqliteStorage> {
    CacheLayer::new(Arc::new(SqliteStorage::open_in_memory().unwrap()))
  }

  fn req(url: &str) -> Request {
    Request::parse(url).unwrap()
  }

  /// Storage whose every operation fails, as with a corrupt database.
  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn open(&self, _name: &str) -> Result<()> {
      Err(eyre!("database disk image is malformed"))
    }

    fn has(&self, _name: &str) -> Result<bool> {
      Err(eyre!("database disk image is malformed"))
    }

    fn keys(&self) -> Result<Vec<String>> {
      Err(eyre!("database disk image is malformed"))
    }

    fn delete(&self, _name: &str) -> Result<bool> {
      Err(eyre!("database disk image is malformed"))
    }

    fn match_request(&self, _name: &str, _request: &Request) -> Result<Option<CachedResponse>> {
      Err(eyre!("database disk image is malformed"))
    }

    fn match_any(&self, _request: &Request) -> Result<Option<CachedResponse>> {
      Err(eyre!("database disk image is malformed"))
    }

    fn put(&self, _name: &str, _request: &Request, _response: &Response) -> Result<()> {
      Err(eyre!("database disk image is malformed"))
    }

    fn put_all(&self, _name: &str, _entries: &[(Request, Response)]) -> Result<()> {
      Err(eyre!("database disk image is malformed"))
    }

    fn entries(&self, _name: &str) -> Result<Vec<String>> {
      Err(eyre!("database disk image is malformed"))
    }
  }

  #[tokio::test]
  async fn test_cache_first_writes_through_then_hits() {
    let layer = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let request = req("https://app.test/app.js");

    let first = layer
      .cache_first("v1", &request, || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(200, "console.log(1)"))
      })
      .await
      .unwrap();
    assert_eq!(first.source, ResponseSource::Network);
    assert!(first.cached_at.is_none());

    let second = layer
      .cache_first("v1", &request, || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(200, "changed"))
      })
      .await
      .unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.data.body, b"console.log(1)");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_first_propagates_network_error() {
    let layer = layer();
    let request = req("https://app.test/missing.png");

    let result = layer
      .cache_first("v1", &request, || async { Err(eyre!("connection refused")) })
      .await;
    assert!(result.is_err());
    assert!(!layer.storage().has("v1").unwrap());
  }

  #[tokio::test]
  async fn test_cache_first_skips_partial_responses() {
    let layer = layer();
    let request = req("https://app.test/movie.mp4");

    let served = layer
      .cache_first("v1", &request, || async { Ok(Response::new(206, "chunk")) })
      .await
      .unwrap();
    assert_eq!(served.data.status, 206);
    assert!(layer.storage().match_any(&request).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_first_does_not_write_cache() {
    let layer = layer();
    let request = req("https://app.test/api/items");
    let fallback = req("https://app.test/api/health");

    let served = layer
      .network_first(&request, &fallback, || async { Ok(Response::new(200, "[]")) })
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert!(layer.storage().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_serves_fallback_on_failure() {
    let layer = layer();
    let request = req("https://app.test/api/items");
    let fallback = req("https://app.test/api/health");
    layer
      .storage()
      .put("v1", &fallback, &Response::new(200, "ok"))
      .unwrap();

    let served = layer
      .network_first(&request, &fallback, || async { Err(eyre!("offline")) })
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.data.body, b"ok");
  }

  #[tokio::test]
  async fn test_network_first_errors_without_fallback() {
    let layer = layer();
    let request = req("https://app.test/api/items");
    let fallback = req("https://app.test/api/health");

    let err = layer
      .network_first(&request, &fallback, || async { Err(eyre!("offline")) })
      .await
      .unwrap_err();
    assert!(err.chain().any(|cause| cause.to_string().contains("offline")));
    assert!(err.to_string().contains("is not cached"));
  }

  #[tokio::test]
  async fn test_network_first_keeps_network_error_when_lookup_fails() {
    let layer = CacheLayer::new(Arc::new(BrokenStorage));
    let request = req("https://app.test/api/items");
    let fallback = req("https://app.test/api/health");

    let err = layer
      .network_first(&request, &fallback, || async { Err(eyre!("connection reset")) })
      .await
      .unwrap_err();
    assert!(err.to_string().contains("connection reset"));
    assert!(err.chain().any(|cause| cause.to_string().contains("malformed")));
  }
}
