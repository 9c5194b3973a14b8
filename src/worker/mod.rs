//! The worker: lifecycle events, the cache controller that handles them, and
//! the registration that drives a worker through install and activation.

mod clients;
mod controller;
mod event;
mod registration;
#[cfg(test)]
mod testing;

pub use clients::{ClientId, Clients, WorkerId};
pub use controller::{CacheController, Strategy};
pub use event::{ControlMessage, EventOutcome, LifecycleEvent};
pub use registration::{Registration, Worker, WorkerState};
