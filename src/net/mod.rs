//! Request/response types and the network backend the worker fetches through.

mod client;
mod types;

pub use client::{HttpClient, Network};
pub use types::{Method, Request, Response};
