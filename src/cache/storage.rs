//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::net::{Method, Request, Response};

/// A response read back from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

/// Named cache stores holding request → response entries.
///
/// Only `GET` requests are ever matched, and storing a non-`GET` request or a
/// `206 Partial Content` response is an error.
pub trait CacheStorage: Send + Sync {
  /// Create the store if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  fn has(&self, name: &str) -> Result<bool>;

  /// All store names, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up a request in one store.
  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Look up a request across all stores, oldest store first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// Store one entry, creating the store if needed. Replaces an existing entry.
  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store every entry or none of them.
  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// URLs of the entries held in a store.
  fn entries(&self, name: &str) -> Result<Vec<String>>;
}

/// Whether a request/response pair may be written to a cache store.
pub fn is_storable(request: &Request, response: &Response) -> bool {
  request.method == Method::Get && response.status != 206
}

fn check_storable(request: &Request, response: &Response) -> Result<()> {
  if request.method != Method::Get {
    return Err(eyre!(
      "Cannot cache {} request for {}: only GET is cacheable",
      request.method,
      request.url
    ));
  }
  if response.status == 206 {
    return Err(eyre!(
      "Cannot cache partial response for {}",
      request.url
    ));
  }
  Ok(())
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A throwaway database that lives as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const CACHE_SCHEMA: &str = r#"
-- One row per named cache store; id preserves creation order
CREATE TABLE IF NOT EXISTS cache_stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(request_key);
"#;

const INSERT_STORE: &str = "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)";

const INSERT_ENTRY: &str =
  "INSERT OR REPLACE INTO cache_entries
     (store_name, request_key, method, url, status, status_text, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))";

/// Raw columns of a stored response, decoded outside the rusqlite closure.
type EntryRow = (u16, String, String, Vec<u8>, String);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
  ))
}

fn decode_entry(row: EntryRow) -> Result<CachedResponse> {
  let (status, status_text, headers, body, cached_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      status_text,
      headers,
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

fn insert_entry(
  conn: &Connection,
  name: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      INSERT_ENTRY,
      params![
        name,
        request.cache_key(),
        request.method.as_str(),
        request.cache_url(),
        response.status,
        response.status_text,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in cache {}: {}", request.url, name, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    self
      .lock()?
      .execute(INSERT_STORE, params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;
    Ok(())
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    if request.method != Method::Get {
      return Ok(None);
    }

    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT status, status_text, headers, body, cached_at FROM cache_entries
         WHERE store_name = ? AND request_key = ?",
        params![name, request.cache_key()],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", name, e))?;

    row.map(decode_entry).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if request.method != Method::Get {
      return Ok(None);
    }

    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT e.status, e.status_text, e.headers, e.body, e.cached_at
         FROM cache_entries e
         INNER JOIN cache_stores s ON s.name = e.store_name
         WHERE e.request_key = ?
         ORDER BY s.id
         LIMIT 1",
        params![request.cache_key()],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query caches: {}", e))?;

    row.map(decode_entry).transpose()
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    check_storable(request, response)?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(INSERT_STORE, params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;
    insert_entry(&tx, name, request, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
    for (request, response) in entries {
      check_storable(request, response)?;
    }

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(INSERT_STORE, params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;
    for (request, response) in entries {
      insert_entry(&tx, name, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entries(&self, name: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE store_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of cache {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    Ok(urls)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
