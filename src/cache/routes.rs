//! Route classification into caching policies.

use reqwest::Method;
use url::Url;

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePolicy {
  /// Serve from cache when warm, refresh in the background
  CacheFirst,
  /// Try the network, fall back to cache
  NetworkFirst,
  /// Serve from cache without waiting, always refresh
  StaleWhileRevalidate,
  /// Network first; an unreachable network queues the mutation
  NetworkFirstWithQueue,
}

/// Small assets that change rarely and tolerate staleness for a request.
const SWR_PREFIXES: &[&str] = &["/static/icons/", "/manifest.json"];

/// Classify a request by method and URL pattern.
pub fn classify(method: &Method, url: &str) -> RoutePolicy {
  if !is_read(method) {
    return RoutePolicy::NetworkFirstWithQueue;
  }

  let path = path_of(url);
  if is_api_path(&path) {
    RoutePolicy::NetworkFirst
  } else if SWR_PREFIXES.iter().any(|p| path.starts_with(p)) {
    RoutePolicy::StaleWhileRevalidate
  } else {
    RoutePolicy::CacheFirst
  }
}

/// Whether the URL addresses the backend API rather than an application
/// asset. Drives the shape of the offline fallback.
pub fn is_api_route(url: &str) -> bool {
  is_api_path(&path_of(url))
}

fn is_read(method: &Method) -> bool {
  *method == Method::GET || *method == Method::HEAD
}

fn is_api_path(path: &str) -> bool {
  path.starts_with("/api/") || path == "/api" || path == "/health"
}

fn path_of(url: &str) -> String {
  if url.contains("://") {
    match Url::parse(url) {
      Ok(parsed) => parsed.path().to_string(),
      Err(_) => url.to_string(),
    }
  } else {
    // Path-only form; drop any query string
    url.split('?').next().unwrap_or(url).to_string()
  }
}
