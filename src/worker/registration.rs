//! Host-side worker lifecycle for one origin.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use super::clients::{ClientId, Clients, WorkerId};
use super::controller::CacheController;
use super::event::{EventOutcome, LifecycleEvent};
use crate::cache::{CacheStorage, Served};
use crate::config::WorkerConfig;
use crate::net::{Network, Request, Response};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, no event dispatched yet
  Parsed,
  /// Install event in progress
  Installing,
  /// Installed, waiting to activate
  Installed,
  /// Activate event in progress
  Activating,
  /// Active and intercepting fetches
  Activated,
  /// Failed or replaced
  Redundant,
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkerState::Parsed => write!(f, "parsed"),
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Installed => write!(f, "installed"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Activated => write!(f, "activated"),
      WorkerState::Redundant => write!(f, "redundant"),
    }
  }
}

/// One worker instance: a controller plus its lifecycle state.
pub struct Worker<S: CacheStorage, N: Network> {
  id: WorkerId,
  state: WorkerState,
  skip_waiting: bool,
  controller: CacheController<S, N>,
}

impl<S: CacheStorage, N: Network> Worker<S, N> {
  pub fn id(&self) -> WorkerId {
    self.id
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn version(&self) -> &str {
    self.controller.version()
  }

  fn set_state(&mut self, state: WorkerState) {
    if self.state != state {
      tracing::debug!(
        worker = self.id,
        version = self.version(),
        from = %self.state,
        to = %state,
        "state change"
      );
      self.state = state;
    }
  }
}

/// The registration of a worker script for one origin.
///
/// Holds at most one waiting and one active worker, plus the open clients.
pub struct Registration<S: CacheStorage, N: Network> {
  origin: Url,
  storage: Arc<S>,
  network: Arc<N>,
  waiting: Option<Worker<S, N>>,
  active: Option<Worker<S, N>>,
  clients: Clients,
  next_worker: WorkerId,
}

impl<S: CacheStorage, N: Network> Registration<S, N> {
  pub fn new(origin: Url, storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      origin,
      storage,
      network,
      waiting: None,
      active: None,
      clients: Clients::default(),
      next_worker: 0,
    }
  }

  pub fn active(&self) -> Option<&Worker<S, N>> {
    self.active.as_ref()
  }

  pub fn waiting(&self) -> Option<&Worker<S, N>> {
    self.waiting.as_ref()
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  fn new_worker(&mut self, config: WorkerConfig) -> Result<Worker<S, N>> {
    config.validate()?;
    self.next_worker += 1;

    Ok(Worker {
      id: self.next_worker,
      state: WorkerState::Parsed,
      skip_waiting: false,
      controller: CacheController::new(
        config,
        self.origin.clone(),
        Arc::clone(&self.storage),
        Arc::clone(&self.network),
      ),
    })
  }

  /// Install a worker for `config` and activate it if nothing holds it back.
  ///
  /// Returns the new worker's state: `Activated`, or `Installed` while it waits.
  pub async fn register(&mut self, config: WorkerConfig) -> Result<WorkerState> {
    let mut worker = self.new_worker(config)?;
    let version = worker.version().to_string();
    worker.set_state(WorkerState::Installing);

    let outcome = match worker.controller.handle(LifecycleEvent::Install).await {
      Ok(outcome) => outcome,
      Err(e) => {
        worker.set_state(WorkerState::Redundant);
        return Err(e.wrap_err(format!("Install of worker {} failed", version)));
      }
    };

    let (cached, skip_waiting) = match outcome {
      EventOutcome::Installed {
        cached,
        skip_waiting,
      } => (cached, skip_waiting),
      other => return Err(eyre!("Install handler returned {:?}", other)),
    };

    worker.set_state(WorkerState::Installed);
    worker.skip_waiting = skip_waiting;
    let id = worker.id;
    tracing::info!(version = %version, cached, "worker installed");

    if let Some(mut previous) = self.waiting.replace(worker) {
      previous.set_state(WorkerState::Redundant);
    }

    self.try_activate().await?;

    Ok(match &self.active {
      Some(active) if active.id == id => WorkerState::Activated,
      _ => WorkerState::Installed,
    })
  }

  /// Rebuild the active worker for an already-installed version.
  pub fn resume(&mut self, config: WorkerConfig) -> Result<()> {
    if !self.storage.has(&config.version)? {
      return Err(eyre!(
        "Worker {} is not installed; run install first",
        config.version
      ));
    }

    let mut worker = self.new_worker(config)?;
    worker.set_state(WorkerState::Activated);
    tracing::debug!(version = worker.version(), "resumed active worker");

    if let Some(mut previous) = self.active.replace(worker) {
      previous.set_state(WorkerState::Redundant);
    }
    Ok(())
  }

  /// Whether the waiting worker may take over now.
  fn can_activate(&self) -> bool {
    match (&self.waiting, &self.active) {
      (None, _) => false,
      (Some(_), None) => true,
      (Some(waiting), Some(active)) => {
        waiting.skip_waiting || self.clients.controlled_by(active.id) == 0
      }
    }
  }

  /// Activate the waiting worker if possible. Returns true if it activated.
  pub async fn try_activate(&mut self) -> Result<bool> {
    if !self.can_activate() {
      return Ok(false);
    }
    let Some(mut worker) = self.waiting.take() else {
      return Ok(false);
    };

    worker.set_state(WorkerState::Activating);
    let outcome = match worker.controller.handle(LifecycleEvent::Activate).await {
      Ok(outcome) => outcome,
      Err(e) => {
        worker.set_state(WorkerState::Redundant);
        return Err(e.wrap_err(format!("Activation of worker {} failed", worker.version())));
      }
    };

    let claim_clients = match outcome {
      EventOutcome::Activated { claim_clients, .. } => claim_clients,
      other => {
        worker.set_state(WorkerState::Redundant);
        return Err(eyre!("Activate handler returned {:?}", other));
      }
    };

    if let Some(mut previous) = self.active.take() {
      previous.set_state(WorkerState::Redundant);
    }
    worker.set_state(WorkerState::Activated);

    if claim_clients {
      let claimed = self.clients.claim(worker.id);
      tracing::debug!(version = worker.version(), claimed, "claimed clients");
    }

    tracing::info!(version = worker.version(), "worker active");
    self.active = Some(worker);
    Ok(true)
  }

  /// Post a message to the waiting worker, or the active one if none waits.
  ///
  /// Returns true if the message was a skip-waiting request.
  pub async fn post_message(&mut self, data: Value) -> Result<bool> {
    if let Some(waiting) = self.waiting.as_mut() {
      let outcome = waiting.controller.handle(LifecycleEvent::Message(data)).await?;
      let skip = message_outcome(outcome)?;
      if skip {
        waiting.skip_waiting = true;
        self.try_activate().await?;
      }
      return Ok(skip);
    }

    match self.active.as_ref() {
      // Already active: skip-waiting has nothing left to skip
      Some(active) => {
        message_outcome(active.controller.handle(LifecycleEvent::Message(data)).await?)
      }
      None => Err(eyre!("No worker to receive message")),
    }
  }

  /// A page opened now is controlled by the active worker, if any.
  pub fn open_client(&mut self) -> ClientId {
    let controller = self.active.as_ref().map(|w| w.id);
    self.clients.open(controller)
  }

  /// Close a page; a waiting worker may activate once the old one is unused.
  pub async fn close_client(&mut self, id: ClientId) -> Result<()> {
    self.clients.close(id);
    self.try_activate().await?;
    Ok(())
  }

  /// Version of the worker controlling a client.
  pub fn client_controller(&self, id: ClientId) -> Option<&str> {
    let controller = self.clients.controller(id)?;
    self
      .active
      .as_ref()
      .filter(|w| w.id == controller)
      .map(|w| w.version())
  }

  /// Send a request through the active worker, or straight to the network.
  pub async fn fetch(&self, request: Request) -> Result<Served<Response>> {
    match self.active.as_ref() {
      Some(active) if active.state == WorkerState::Activated => {
        match active.controller.handle(LifecycleEvent::Fetch(request)).await? {
          EventOutcome::Responded(served) => Ok(served),
          other => Err(eyre!("Fetch handler returned {:?}", other)),
        }
      }
      _ => {
        let response = self.network.fetch(request).await?;
        Ok(Served::from_network(response))
      }
    }
  }
}

fn message_outcome(outcome: EventOutcome) -> Result<bool> {
  match outcome {
    EventOutcome::Message { skip_waiting } => Ok(skip_waiting),
    other => Err(eyre!("Message handler returned {:?}", other)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::worker::testing::ScriptedNetwork;
  use serde_json::json;

  type TestRegistration = Registration<SqliteStorage, ScriptedNetwork>;

  fn setup() -> (TestRegistration, Arc<SqliteStorage>, Arc<ScriptedNetwork>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(
      ScriptedNetwork::new()
        .route("https://app.test/", Response::new(200, "home"))
        .route("https://app.test/api/health", Response::new(200, "ok")),
    );
    let registration = Registration::new(
      Url::parse("https://app.test/").unwrap(),
      Arc::clone(&storage),
      Arc::clone(&network),
    );
    (registration, storage, network)
  }

  fn config(version: &str, skip_waiting_on_install: bool) -> WorkerConfig {
    WorkerConfig {
      version: version.to_string(),
      skip_waiting_on_install,
      ..WorkerConfig::default()
    }
  }

  #[tokio::test]
  async fn test_first_worker_activates_immediately() {
    let (mut reg, storage, _) = setup();

    let state = reg.register(config("v1", false)).await.unwrap();
    assert_eq!(state, WorkerState::Activated);
    assert!(reg.waiting().is_none());
    assert_eq!(reg.active().unwrap().version(), "v1");
    assert_eq!(storage.keys().unwrap(), vec!["v1"]);
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_worker() {
    let (mut reg, storage, network) = setup();
    reg.register(config("v1", true)).await.unwrap();

    network.go_offline();
    assert!(reg.register(config("v2", true)).await.is_err());
    assert_eq!(reg.active().unwrap().version(), "v1");
    assert!(reg.waiting().is_none());
    assert_eq!(storage.keys().unwrap(), vec!["v1"]);
  }

  #[tokio::test]
  async fn test_version_bump_deletes_old_cache() {
    let (mut reg, storage, _) = setup();
    reg.register(config("v1", true)).await.unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["v1"]);

    let state = reg.register(config("v2", true)).await.unwrap();
    assert_eq!(state, WorkerState::Activated);
    assert_eq!(storage.keys().unwrap(), vec!["v2"]);
    assert_eq!(reg.active().unwrap().version(), "v2");
  }

  #[tokio::test]
  async fn test_new_worker_waits_while_old_controls_clients() {
    let (mut reg, storage, _) = setup();
    reg.register(config("v1", false)).await.unwrap();
    let page = reg.open_client();
    assert_eq!(reg.client_controller(page), Some("v1"));

    let state = reg.register(config("v2", false)).await.unwrap();
    assert_eq!(state, WorkerState::Installed);
    assert_eq!(reg.waiting().unwrap().version(), "v2");
    assert_eq!(reg.active().unwrap().version(), "v1");
    // Both generations coexist until activation
    assert_eq!(storage.keys().unwrap(), vec!["v1", "v2"]);

    reg.close_client(page).await.unwrap();
    assert!(reg.waiting().is_none());
    assert_eq!(reg.active().unwrap().version(), "v2");
    assert_eq!(storage.keys().unwrap(), vec!["v2"]);
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates_waiting_worker() {
    let (mut reg, storage, _) = setup();
    reg.register(config("v1", false)).await.unwrap();
    let page = reg.open_client();
    reg.register(config("v2", false)).await.unwrap();

    // Unrelated messages leave it waiting
    assert!(!reg.post_message(json!({ "type": "PING" })).await.unwrap());
    assert_eq!(reg.waiting().unwrap().state(), WorkerState::Installed);

    assert!(reg.post_message(json!({ "type": "SKIP_WAITING" })).await.unwrap());
    assert!(reg.waiting().is_none());
    assert_eq!(reg.active().unwrap().version(), "v2");
    assert_eq!(storage.keys().unwrap(), vec!["v2"]);
    // Activation claims the page that was open all along
    assert_eq!(reg.client_controller(page), Some("v2"));
  }

  #[tokio::test]
  async fn test_skip_waiting_on_install_claims_open_clients() {
    let (mut reg, _, _) = setup();
    reg.register(config("v1", true)).await.unwrap();
    let page = reg.open_client();

    let state = reg.register(config("v2", true)).await.unwrap();
    assert_eq!(state, WorkerState::Activated);
    assert_eq!(reg.client_controller(page), Some("v2"));
    assert_eq!(reg.clients().controlled_by(reg.active().unwrap().id()), 1);
  }

  #[tokio::test]
  async fn test_message_without_workers_is_an_error() {
    let (mut reg, _, _) = setup();
    assert!(reg.post_message(json!({ "type": "SKIP_WAITING" })).await.is_err());
  }

  #[tokio::test]
  async fn test_fetch_bypasses_worker_until_active() {
    let (mut reg, storage, network) = setup();
    network.set_route("https://app.test/page.html", Response::new(200, "page"));
    let request = Request::parse("https://app.test/page.html").unwrap();

    let served = reg.fetch(request.clone()).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert!(storage.keys().unwrap().is_empty());

    reg.register(config("v1", true)).await.unwrap();
    reg.fetch(request.clone()).await.unwrap();
    let served = reg.fetch(request).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_resume_requires_installed_cache() {
    let (mut reg, storage, network) = setup();
    assert!(reg.resume(config("v1", true)).is_err());

    reg.register(config("v1", true)).await.unwrap();

    // A fresh registration over the same storage, as after a restart
    let mut restarted = Registration::new(
      Url::parse("https://app.test/").unwrap(),
      Arc::clone(&storage),
      Arc::clone(&network),
    );
    restarted.resume(config("v1", true)).unwrap();
    assert_eq!(restarted.active().unwrap().state(), WorkerState::Activated);

    network.go_offline();
    let served = restarted
      .fetch(Request::parse("https://app.test/").unwrap())
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Cache);

    network.go_online();
    let served = restarted
      .fetch(Request::parse("https://app.test/api/health").unwrap())
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Network);
  }
}
