//! In-process network fake for worker tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::net::{Network, Request, Response};

/// Answers from a fixed URL → response table; unknown URLs get a 404.
#[derive(Default)]
pub struct ScriptedNetwork {
  routes: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  calls: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(self, url: &str, response: Response) -> Self {
    self.set_route(url, response);
    self
  }

  pub fn set_route(&self, url: &str, response: Response) {
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  /// Every subsequent fetch fails as if the network were unreachable.
  pub fn go_offline(&self) {
    self.offline.store(true, Ordering::SeqCst);
  }

  pub fn go_online(&self) {
    self.offline.store(false, Ordering::SeqCst);
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_for(&self, url: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
  }
}

impl Network for ScriptedNetwork {
  async fn fetch(&self, request: Request) -> Result<Response> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", url));
    }

    let response = self.routes.lock().unwrap().get(&url).cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, "not found")))
  }
}
