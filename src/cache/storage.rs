//! Snapshot persistence for cached responses.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use sha2::{Digest, Sha256};

use crate::store::{format_datetime, parse_datetime, Store};

use super::quota::CacheInventory;

/// Cache namespaces, one per resource class. Each is versioned with the
/// layer's own version tag so successive builds never share entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
  /// Application shell assets (pages, manifest, icons)
  Static,
  /// Backend API read responses
  Api,
}

impl CacheNamespace {
  pub const ALL: [CacheNamespace; 2] = [Self::Static, Self::Api];

  fn class(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Api => "api",
    }
  }
}

/// A captured response: status, headers, body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// First header value with the given name, case-insensitive.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A snapshot together with its capture timestamp. The timestamp drives
/// both staleness decisions and eviction ordering.
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
  pub snapshot: ResponseSnapshot,
  pub cached_at: DateTime<Utc>,
}

/// Canonical request identity for read caching: method + URL, hashed to a
/// stable fixed-length key.
pub fn request_key(method: &str, url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(method.to_uppercase().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// Versioned snapshot store over the shared database.
pub struct SnapshotStore {
  store: Store,
  version: String,
}

impl SnapshotStore {
  pub fn new(store: Store, version: &str) -> Self {
    Self {
      store,
      version: version.to_string(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  fn namespace(&self, ns: CacheNamespace) -> String {
    format!("{}-{}", ns.class(), self.version)
  }

  pub fn get(&self, ns: CacheNamespace, key: &str) -> Result<Option<CachedSnapshot>> {
    let conn = self.store.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM snapshot_cache
         WHERE namespace = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare snapshot query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![self.namespace(ns), key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers_json, body, cached_at)) => Ok(Some(CachedSnapshot {
        snapshot: ResponseSnapshot {
          status,
          headers: serde_json::from_str(&headers_json)
            .map_err(|e| eyre!("Failed to parse stored headers: {}", e))?,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  pub fn put(
    &self,
    ns: CacheNamespace,
    key: &str,
    url: &str,
    snapshot: &ResponseSnapshot,
  ) -> Result<()> {
    let conn = self.store.lock()?;
    let headers_json = serde_json::to_string(&snapshot.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO snapshot_cache (namespace, request_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          self.namespace(ns),
          key,
          url,
          snapshot.status,
          headers_json,
          snapshot.body,
          format_datetime(Utc::now())
        ],
      )
      .map_err(|e| eyre!("Failed to store snapshot: {}", e))?;

    Ok(())
  }

  /// Entry count and estimated byte usage for one namespace.
  pub fn inventory(&self, ns: CacheNamespace) -> Result<CacheInventory> {
    let conn = self.store.lock()?;

    conn
      .query_row(
        "SELECT COUNT(*), COALESCE(SUM(LENGTH(body) + LENGTH(headers) + LENGTH(url)), 0)
         FROM snapshot_cache WHERE namespace = ?",
        params![self.namespace(ns)],
        |row| {
          Ok(CacheInventory {
            entry_count: row.get(0)?,
            estimated_size: row.get(1)?,
          })
        },
      )
      .map_err(|e| eyre!("Failed to compute cache inventory: {}", e))
  }

  /// Remove the oldest `fraction` of entries in a namespace, by capture
  /// timestamp. Returns the number removed.
  pub fn evict_oldest(&self, ns: CacheNamespace, fraction: f64) -> Result<usize> {
    let count = self.inventory(ns)?.entry_count;
    if count == 0 {
      return Ok(0);
    }

    let victims = ((count as f64) * fraction).ceil() as i64;
    let conn = self.store.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM snapshot_cache WHERE namespace = ?1 AND request_key IN (
           SELECT request_key FROM snapshot_cache WHERE namespace = ?1
           ORDER BY cached_at, rowid LIMIT ?2
         )",
        params![self.namespace(ns), victims],
      )
      .map_err(|e| eyre!("Failed to evict snapshots: {}", e))?;

    Ok(removed)
  }

  /// Drop every namespace that does not belong to this version. Called at
  /// activation so a new build starts from its own entries only.
  pub fn retain_version(&self) -> Result<usize> {
    let conn = self.store.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM snapshot_cache WHERE namespace NOT IN (?, ?)",
        params![
          self.namespace(CacheNamespace::Static),
          self.namespace(CacheNamespace::Api)
        ],
      )
      .map_err(|e| eyre!("Failed to prune old cache versions: {}", e))?;

    Ok(removed)
  }

  /// Rewrite an entry's capture timestamp. Test hook for eviction ordering.
  #[cfg(test)]
  pub fn backdate(&self, ns: CacheNamespace, key: &str, cached_at: DateTime<Utc>) -> Result<()> {
    let conn = self.store.lock()?;
    conn
      .execute(
        "UPDATE snapshot_cache SET cached_at = ? WHERE namespace = ? AND request_key = ?",
        params![format_datetime(cached_at), self.namespace(ns), key],
      )
      .map_err(|e| eyre!("Failed to backdate snapshot: {}", e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn snapshot(body: &str) -> ResponseSnapshot {
    ResponseSnapshot {
      status: 200,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  fn test_store() -> SnapshotStore {
    SnapshotStore::new(Store::open_in_memory().unwrap(), "0.2.0")
  }

  #[test]
  fn test_put_get_round_trip() {
    let store = test_store();
    let key = request_key("GET", "/api/v1/sessions");
    store
      .put(CacheNamespace::Api, &key, "/api/v1/sessions", &snapshot("[]"))
      .unwrap();

    let cached = store.get(CacheNamespace::Api, &key).unwrap().unwrap();
    assert_eq!(cached.snapshot, snapshot("[]"));

    // Namespaces are disjoint
    assert!(store.get(CacheNamespace::Static, &key).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_and_refreshes_timestamp() {
    let store = test_store();
    let key = request_key("GET", "/health");
    store.put(CacheNamespace::Api, &key, "/health", &snapshot("v1")).unwrap();
    store.put(CacheNamespace::Api, &key, "/health", &snapshot("v2")).unwrap();

    let cached = store.get(CacheNamespace::Api, &key).unwrap().unwrap();
    assert_eq!(cached.snapshot.body, b"v2");
    assert_eq!(store.inventory(CacheNamespace::Api).unwrap().entry_count, 1);
  }

  #[test]
  fn test_evict_oldest_removes_by_capture_time() {
    let store = test_store();
    for i in 0..8 {
      let key = request_key("GET", &format!("/static/js/{}.js", i));
      store
        .put(CacheNamespace::Static, &key, &format!("/static/js/{}.js", i), &snapshot("x"))
        .unwrap();
    }

    // Make entries 0 and 1 clearly the oldest
    for i in 0..2 {
      let key = request_key("GET", &format!("/static/js/{}.js", i));
      store
        .backdate(CacheNamespace::Static, &key, Utc::now() - Duration::hours(1))
        .unwrap();
    }

    let removed = store.evict_oldest(CacheNamespace::Static, 0.25).unwrap();
    assert_eq!(removed, 2);

    for i in 0..2 {
      let key = request_key("GET", &format!("/static/js/{}.js", i));
      assert!(store.get(CacheNamespace::Static, &key).unwrap().is_none());
    }
  }

  #[test]
  fn test_retain_version_prunes_other_versions() {
    let shared = Store::open_in_memory().unwrap();
    let old = SnapshotStore::new(shared.clone(), "0.1.0");
    let new = SnapshotStore::new(shared, "0.2.0");

    let key = request_key("GET", "/");
    old.put(CacheNamespace::Static, &key, "/", &snapshot("old")).unwrap();
    new.put(CacheNamespace::Static, &key, "/", &snapshot("new")).unwrap();

    let removed = new.retain_version().unwrap();
    assert_eq!(removed, 1);
    assert!(old.get(CacheNamespace::Static, &key).unwrap().is_none());
    assert_eq!(
      new.get(CacheNamespace::Static, &key).unwrap().unwrap().snapshot.body,
      b"new"
    );
  }

  #[test]
  fn test_request_key_distinguishes_method_and_url() {
    let a = request_key("GET", "/api/v1/sessions");
    assert_eq!(a, request_key("get", "/api/v1/sessions"));
    assert_ne!(a, request_key("GET", "/api/v1/sessions/1"));
    assert_ne!(a, request_key("HEAD", "/api/v1/sessions"));
  }
}
