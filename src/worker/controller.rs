//! Cache controller: the fetch-interception and cache-lifecycle policy.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use super::event::{ControlMessage, EventOutcome, LifecycleEvent};
use crate::cache::{CacheLayer, CacheStorage, Served};
use crate::config::WorkerConfig;
use crate::net::{Network, Request, Response};

/// Caching strategy applied to an intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Live network, cached offline fallback on failure
  NetworkFirst,
  /// Stored response, network with write-through on a miss
  CacheFirst,
}

/// Mediates all network access for the clients of one worker version.
pub struct CacheController<S: CacheStorage, N: Network> {
  config: Arc<WorkerConfig>,
  /// Base URL core asset paths are resolved against
  origin: Url,
  cache: CacheLayer<S>,
  network: Arc<N>,
}

impl<S: CacheStorage, N: Network> CacheController<S, N> {
  pub fn new(config: WorkerConfig, origin: Url, storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      config: Arc::new(config),
      origin,
      cache: CacheLayer::new(storage),
      network,
    }
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn version(&self) -> &str {
    &self.config.version
  }

  /// Dispatch one event to its handler.
  pub async fn handle(&self, event: LifecycleEvent) -> Result<EventOutcome> {
    tracing::trace!(event = event.kind(), version = self.version(), "dispatch");

    match event {
      LifecycleEvent::Install => {
        let cached = self.install().await?;
        Ok(EventOutcome::Installed {
          cached,
          skip_waiting: self.config.skip_waiting_on_install,
        })
      }
      LifecycleEvent::Activate => Ok(EventOutcome::Activated {
        deleted: self.activate().await?,
        claim_clients: true,
      }),
      LifecycleEvent::Message(data) => Ok(EventOutcome::Message {
        skip_waiting: self.message(&data),
      }),
      LifecycleEvent::Fetch(request) => Ok(EventOutcome::Responded(self.fetch(request).await?)),
    }
  }

  /// Fetch every core asset and store them all in the current cache.
  ///
  /// Any network failure or non-2xx response aborts the install before
  /// anything is written. Returns the number of assets stored.
  pub async fn install(&self) -> Result<usize> {
    let requests = self
      .config
      .core
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid core asset path {}: {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let entries = try_join_all(requests.into_iter().map(|request| async move {
      let response = self.network.fetch(request.clone()).await?;
      if !response.ok() {
        return Err(eyre!(
          "Core asset {} returned {} {}",
          request.url,
          response.status,
          response.status_text
        ));
      }
      Ok::<_, color_eyre::Report>((request, response))
    }))
    .await?;

    self.cache.storage().put_all(self.version(), &entries)?;

    tracing::info!(version = self.version(), assets = entries.len(), "installed core assets");
    Ok(entries.len())
  }

  /// Delete every cache store that does not belong to this version.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let storage = self.cache.storage();
    let mut deleted = Vec::new();

    for name in storage.keys()? {
      if name != self.version() && storage.delete(&name)? {
        deleted.push(name);
      }
    }

    tracing::info!(version = self.version(), deleted = ?deleted, "activated");
    Ok(deleted)
  }

  /// Returns true when the message asks this worker to skip waiting.
  pub fn message(&self, data: &Value) -> bool {
    match ControlMessage::parse(data) {
      Some(ControlMessage::SkipWaiting) => {
        tracing::debug!(version = self.version(), "skip-waiting requested");
        true
      }
      None => false,
    }
  }

  /// Which strategy handles a URL: a pure function of its path.
  pub fn strategy_for(&self, url: &Url) -> Strategy {
    if url.path().starts_with(&self.config.api_prefix) {
      Strategy::NetworkFirst
    } else {
      Strategy::CacheFirst
    }
  }

  /// Produce the response for an intercepted request.
  pub async fn fetch(&self, request: Request) -> Result<Served<Response>> {
    match self.strategy_for(&request.url) {
      Strategy::NetworkFirst => {
        let fallback = self
          .origin
          .join(&self.config.offline_fallback)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid offline fallback path: {}", e))?;

        self
          .cache
          .network_first(&request, &fallback, || self.network.fetch(request.clone()))
          .await
      }
      Strategy::CacheFirst => {
        self
          .cache
          .cache_first(self.version(), &request, || {
            self.network.fetch(request.clone())
          })
          .await
      }
    }
  }
}
