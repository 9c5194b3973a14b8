use std::collections::BTreeMap;

/// Identifier of an open page
pub type ClientId = u64;

/// Identifier of a worker instance within a registration
pub type WorkerId = u64;

/// Open pages of the origin and the worker controlling each one
#[derive(Debug, Default)]
pub struct Clients {
  next_id: ClientId,
  controllers: BTreeMap<ClientId, Option<WorkerId>>,
}

impl Clients {
  /// Track a new page, controlled by `controller` if one is active.
  pub fn open(&mut self, controller: Option<WorkerId>) -> ClientId {
    self.next_id += 1;
    self.controllers.insert(self.next_id, controller);
    self.next_id
  }

  pub fn close(&mut self, id: ClientId) -> bool {
    self.controllers.remove(&id).is_some()
  }

  pub fn controller(&self, id: ClientId) -> Option<WorkerId> {
    self.controllers.get(&id).copied().flatten()
  }

  pub fn controlled_by(&self, worker: WorkerId) -> usize {
    self
      .controllers
      .values()
      .filter(|c| **c == Some(worker))
      .count()
  }

  /// Make `worker` the controller of every open page. Returns how many changed.
  pub fn claim(&mut self, worker: WorkerId) -> usize {
    let mut changed = 0;
    for controller in self.controllers.values_mut() {
      if *controller != Some(worker) {
        *controller = Some(worker);
        changed += 1;
      }
    }
    changed
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_close() {
    let mut clients = Clients::default();
    let a = clients.open(None);
    let b = clients.open(Some(1));
    assert_ne!(a, b);
    assert_eq!(clients.controller(a), None);
    assert_eq!(clients.controller(b), Some(1));

    assert!(clients.close(a));
    assert!(!clients.close(a));
    // only b is left to claim
    assert_eq!(clients.claim(2), 1);
  }

  #[test]
  fn test_claim_takes_over_every_client() {
    let mut clients = Clients::default();
    clients.open(None);
    clients.open(Some(1));
    clients.open(Some(2));

    assert_eq!(clients.claim(2), 2);
    assert_eq!(clients.controlled_by(2), 3);
    assert_eq!(clients.controlled_by(1), 0);
    assert_eq!(clients.claim(2), 0);
  }
}
