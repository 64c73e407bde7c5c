//! Per-route caching strategies over the snapshot store.

use std::sync::Arc;

use reqwest::Method;
use tracing::{debug, warn};

use crate::net::FetchTransport;
use crate::queue::{MutationBody, MutationQueue};

use super::quota::QuotaGovernor;
use super::routes::{classify, is_api_route, RoutePolicy};
use super::storage::{request_key, CacheNamespace, ResponseSnapshot, SnapshotStore};

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: Method,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<MutationBody>,
}

impl FetchRequest {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: Method::GET,
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn mutation(method: Method, url: impl Into<String>, body: Option<MutationBody>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: Vec::new(),
      body,
    }
  }
}

/// Minimal page served for application routes while offline with a cold
/// cache.
const OFFLINE_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>Dialtone - offline</title></head>\n<body>\n<h1>You are offline</h1>\n<p>Dialtone could not reach the network and has nothing cached for this page yet. Your recordings and edits are kept locally and will sync when you are back online.</p>\n</body>\n</html>\n";

/// Applies the per-route policy to every intercepted request.
///
/// The engine never fails the caller: network and storage problems degrade
/// to cached snapshots, offline fallbacks, or a queued acknowledgment.
pub struct CacheStrategyEngine<T: FetchTransport + 'static> {
  snapshots: Arc<SnapshotStore>,
  governor: Arc<QuotaGovernor>,
  queue: Arc<MutationQueue>,
  transport: Arc<T>,
}

impl<T: FetchTransport + 'static> CacheStrategyEngine<T> {
  pub fn new(
    snapshots: Arc<SnapshotStore>,
    governor: Arc<QuotaGovernor>,
    queue: Arc<MutationQueue>,
    transport: Arc<T>,
  ) -> Self {
    Self {
      snapshots,
      governor,
      queue,
      transport,
    }
  }

  /// Serve one intercepted request according to its route policy.
  pub async fn handle(&self, request: FetchRequest) -> ResponseSnapshot {
    match classify(&request.method, &request.url) {
      RoutePolicy::CacheFirst => self.cache_first(request).await,
      RoutePolicy::NetworkFirst => self.network_first(request).await,
      RoutePolicy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
      RoutePolicy::NetworkFirstWithQueue => self.mutation(request).await,
    }
  }

  async fn cache_first(&self, request: FetchRequest) -> ResponseSnapshot {
    let ns = namespace_for(&request.url);
    let key = request_key(request.method.as_str(), &request.url);

    match self.snapshots.get(ns, &key) {
      Ok(Some(cached)) => {
        // Warm hit: serve immediately, refresh behind the caller's back
        self.spawn_refresh(request, ns, key);
        cached.snapshot
      }
      other => {
        if let Err(e) = other {
          warn!(url = %request.url, "cache read failed: {}", e);
        }
        self.fetch_and_store(request, ns, key).await
      }
    }
  }

  async fn network_first(&self, request: FetchRequest) -> ResponseSnapshot {
    let ns = namespace_for(&request.url);
    let key = request_key(request.method.as_str(), &request.url);

    match self
      .transport
      .fetch(&request.method, &request.url, &request.headers, None)
      .await
    {
      Ok(snapshot) => {
        if snapshot.is_success() {
          self.store_snapshot(ns, &key, &request.url, &snapshot);
        }
        snapshot
      }
      Err(e) => {
        // Only an observed network failure consults the cache
        debug!(url = %request.url, "network-first fetch failed: {}", e);
        match self.snapshots.get(ns, &key) {
          Ok(Some(cached)) => cached.snapshot,
          _ => offline_response(&request.url, &e.to_string()),
        }
      }
    }
  }

  async fn stale_while_revalidate(&self, request: FetchRequest) -> ResponseSnapshot {
    let ns = namespace_for(&request.url);
    let key = request_key(request.method.as_str(), &request.url);

    match self.snapshots.get(ns, &key) {
      Ok(Some(cached)) => {
        self.spawn_refresh(request, ns, key);
        cached.snapshot
      }
      other => {
        if let Err(e) = other {
          warn!(url = %request.url, "cache read failed: {}", e);
        }
        // Cold cache: the caller waits on the network result
        self.fetch_and_store(request, ns, key).await
      }
    }
  }

  async fn mutation(&self, request: FetchRequest) -> ResponseSnapshot {
    match self
      .transport
      .fetch(
        &request.method,
        &request.url,
        &request.headers,
        request.body.as_ref(),
      )
      .await
    {
      // Whatever the backend returns is passed through, uncached
      Ok(snapshot) => snapshot,
      Err(e) => {
        let message = e.to_string();
        match self.queue.enqueue(
          &request.url,
          request.method.as_str(),
          &request.headers,
          request.body,
        ) {
          Ok(id) => {
            debug!(id, url = %request.url, "mutation accepted for later delivery");
            queued_response(&message)
          }
          Err(qe) => {
            // A mutation that cannot be captured in replayable form would
            // fail every future replay too; drop it instead of queueing
            warn!(url = %request.url, "dropping uncapturable mutation: {}", qe);
            offline_response(&request.url, &message)
          }
        }
      }
    }
  }

  async fn fetch_and_store(
    &self,
    request: FetchRequest,
    ns: CacheNamespace,
    key: String,
  ) -> ResponseSnapshot {
    match self
      .transport
      .fetch(&request.method, &request.url, &request.headers, None)
      .await
    {
      Ok(snapshot) => {
        if snapshot.is_success() {
          self.store_snapshot(ns, &key, &request.url, &snapshot);
        }
        snapshot
      }
      Err(e) => offline_response(&request.url, &e.to_string()),
    }
  }

  /// Refresh a cached entry without blocking the caller. Failures never
  /// surface to the original request.
  fn spawn_refresh(&self, request: FetchRequest, ns: CacheNamespace, key: String) {
    let transport = Arc::clone(&self.transport);
    let snapshots = Arc::clone(&self.snapshots);
    let governor = Arc::clone(&self.governor);

    tokio::spawn(async move {
      match transport
        .fetch(&request.method, &request.url, &request.headers, None)
        .await
      {
        Ok(snapshot) if snapshot.is_success() => {
          store_with_quota(&snapshots, &governor, ns, &key, &request.url, &snapshot);
        }
        Ok(snapshot) => {
          debug!(url = %request.url, status = snapshot.status, "background refresh rejected");
        }
        Err(e) => {
          debug!(url = %request.url, "background refresh failed: {}", e);
        }
      }
    });
  }

  fn store_snapshot(&self, ns: CacheNamespace, key: &str, url: &str, snapshot: &ResponseSnapshot) {
    store_with_quota(&self.snapshots, &self.governor, ns, key, url, snapshot);
  }

  #[cfg(test)]
  pub(crate) fn snapshots(&self) -> &SnapshotStore {
    &self.snapshots
  }
}

/// Store a snapshot and run the quota limit check. Both are best-effort:
/// the network result is served even when it could not be cached.
fn store_with_quota(
  snapshots: &SnapshotStore,
  governor: &QuotaGovernor,
  ns: CacheNamespace,
  key: &str,
  url: &str,
  snapshot: &ResponseSnapshot,
) {
  if let Err(e) = snapshots.put(ns, key, url, snapshot) {
    warn!(url, "response could not be cached: {}", e);
    return;
  }
  if let Err(e) = governor.enforce(snapshots) {
    warn!("quota check failed: {}", e);
  }
}

fn namespace_for(url: &str) -> CacheNamespace {
  if is_api_route(url) {
    CacheNamespace::Api
  } else {
    CacheNamespace::Static
  }
}

/// Structured 503 for an undeliverable API read; a readable placeholder
/// page for everything else.
fn offline_response(url: &str, message: &str) -> ResponseSnapshot {
  if is_api_route(url) {
    let body = serde_json::json!({ "offline": true, "error": message });
    ResponseSnapshot {
      status: 503,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: body.to_string().into_bytes(),
    }
  } else {
    ResponseSnapshot {
      status: 503,
      headers: vec![("content-type".to_string(), "text/html; charset=utf-8".to_string())],
      body: OFFLINE_PAGE.as_bytes().to_vec(),
    }
  }
}

/// 202 acknowledgment for a mutation accepted into the queue.
fn queued_response(message: &str) -> ResponseSnapshot {
  let body = serde_json::json!({ "queued": true, "error": message });
  ResponseSnapshot {
    status: 202,
    headers: vec![("content-type".to_string(), "application/json".to_string())],
    body: body.to_string().into_bytes(),
  }
}
