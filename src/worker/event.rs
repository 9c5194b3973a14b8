use serde::Deserialize;
use serde_json::Value;

use crate::cache::Served;
use crate::net::{Request, Response};

/// Events a worker reacts to
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
  /// Populate the current cache with the core assets
  Install,
  /// Drop superseded caches and take control of open clients
  Activate,
  /// Structured message posted by a client
  Message(Value),
  /// Intercepted request that needs a response
  Fetch(Request),
}

impl LifecycleEvent {
  pub fn kind(&self) -> &'static str {
    match self {
      LifecycleEvent::Install => "install",
      LifecycleEvent::Activate => "activate",
      LifecycleEvent::Message(_) => "message",
      LifecycleEvent::Fetch(_) => "fetch",
    }
  }
}

/// What the host should do once an event handler has finished
#[derive(Debug, Clone)]
pub enum EventOutcome {
  Installed {
    /// Number of core assets stored
    cached: usize,
    skip_waiting: bool,
  },
  Activated {
    /// Cache stores removed because they belong to older versions
    deleted: Vec<String>,
    claim_clients: bool,
  },
  Message {
    skip_waiting: bool,
  },
  Responded(Served<Response>),
}

/// Control messages a worker understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
}

impl ControlMessage {
  /// Recognise a control message. Anything else yields `None`.
  pub fn parse(data: &Value) -> Option<Self> {
    Self::deserialize(data).ok()
  }
}
