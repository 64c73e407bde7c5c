//! Storage quota governance.
//!
//! The bound is intentionally coarse: usage is estimated from stored sizes
//! and compared against a percentage threshold, and a cleanup pass removes a
//! fixed fraction of the oldest entries per namespace. Byte-exact accounting
//! would cost more than the check is worth at this call frequency.

use color_eyre::Result;
use tracing::info;

use crate::config::CacheConfig;

use super::storage::{CacheNamespace, SnapshotStore};

/// Per-namespace aggregate, recomputed on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheInventory {
  pub entry_count: u64,
  pub estimated_size: u64,
}

/// Bounds persistent cache usage via eviction.
pub struct QuotaGovernor {
  quota_bytes: u64,
  cleanup_threshold: f64,
  evict_fraction: f64,
}

impl QuotaGovernor {
  pub fn new(config: &CacheConfig) -> Self {
    Self {
      quota_bytes: config.quota_bytes,
      cleanup_threshold: config.cleanup_threshold,
      evict_fraction: config.evict_fraction,
    }
  }

  /// Estimated usage across all managed namespaces.
  pub fn usage(&self, store: &SnapshotStore) -> Result<u64> {
    let mut total = 0;
    for ns in CacheNamespace::ALL {
      total += store.inventory(ns)?.estimated_size;
    }
    Ok(total)
  }

  /// Run the limit check; above the threshold, evict the oldest fraction of
  /// entries in every namespace. Returns the number of entries removed.
  pub fn enforce(&self, store: &SnapshotStore) -> Result<usize> {
    let used = self.usage(store)?;
    if (used as f64) < self.quota_bytes as f64 * self.cleanup_threshold {
      return Ok(0);
    }

    let mut removed = 0;
    for ns in CacheNamespace::ALL {
      removed += store.evict_oldest(ns, self.evict_fraction)?;
    }

    info!(used, quota = self.quota_bytes, removed, "cache cleanup pass");
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{request_key, ResponseSnapshot};
  use crate::store::Store;
  use chrono::{Duration, Utc};

  fn filled_store(entries_per_ns: usize, body_size: usize) -> SnapshotStore {
    let store = SnapshotStore::new(Store::open_in_memory().unwrap(), "0.2.0");
    for ns in CacheNamespace::ALL {
      for i in 0..entries_per_ns {
        let url = format!("/{:?}/{}", ns, i);
        let key = request_key("GET", &url);
        store
          .put(ns, &key, &url, &ResponseSnapshot {
            status: 200,
            headers: vec![],
            body: vec![0u8; body_size],
          })
          .unwrap();
      }
    }
    store
  }

  #[test]
  fn test_under_threshold_is_a_noop() {
    let store = filled_store(4, 100);
    let governor = QuotaGovernor::new(&CacheConfig::default());
    assert_eq!(governor.enforce(&store).unwrap(), 0);
    assert_eq!(store.inventory(CacheNamespace::Api).unwrap().entry_count, 4);
  }

  #[test]
  fn test_crossing_threshold_evicts_oldest_quarter_per_namespace() {
    // 8 entries x 1000 bytes per namespace against a 10KB quota: usage is
    // well past 80%
    let store = filled_store(8, 1000);
    let governor = QuotaGovernor::new(&CacheConfig {
      quota_bytes: 10_000,
      ..CacheConfig::default()
    });

    // Make the first two entries of the api namespace the oldest overall
    for i in 0..2 {
      let url = format!("/{:?}/{}", CacheNamespace::Api, i);
      store
        .backdate(
          CacheNamespace::Api,
          &request_key("GET", &url),
          Utc::now() - Duration::hours(1),
        )
        .unwrap();
    }

    let removed = governor.enforce(&store).unwrap();
    assert_eq!(removed, 4); // 25% of 8, in each of the two namespaces

    for ns in CacheNamespace::ALL {
      assert_eq!(store.inventory(ns).unwrap().entry_count, 6);
    }
    // The backdated entries were the ones chosen in the api namespace
    for i in 0..2 {
      let url = format!("/{:?}/{}", CacheNamespace::Api, i);
      assert!(store
        .get(CacheNamespace::Api, &request_key("GET", &url))
        .unwrap()
        .is_none());
    }
  }
}
