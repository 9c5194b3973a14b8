//! An offline-capable caching worker for a web origin.
//!
//! A versioned cache of core assets is populated on install and superseded
//! caches are dropped on activate. Intercepted requests are served
//! cache-first, except API paths which go network-first with a cached
//! fallback.

pub mod cache;
pub mod config;
pub mod logging;
pub mod net;
pub mod worker;
