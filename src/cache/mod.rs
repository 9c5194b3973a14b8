//! Named, versioned cache stores and the strategies built on them.
//!
//! This module provides:
//! - A storage trait over named cache stores keyed by request identity
//! - A SQLite backend that persists stores across restarts
//! - Cache-first (with write-through) and network-first (with cached
//!   fallback) strategies over an arbitrary network fetcher

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, CachedResponse, SqliteStorage};
pub use traits::{ResponseSource, Served};
