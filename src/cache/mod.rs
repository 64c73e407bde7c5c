//! Response snapshot caching with per-route strategies.
//!
//! This module decides how each intercepted read is served:
//! - Application assets are cache-first with background refresh
//! - Backend API reads are network-first with cache fallback
//! - Selected small assets are served stale-while-revalidate
//! Mutations that cannot reach the network are handed off to the queue.
//!
//! Storage is bounded by the co-located quota governor, which evicts the
//! oldest entries per namespace when usage crosses the configured ceiling.

mod quota;
mod routes;
mod storage;
mod strategy;

pub use quota::{CacheInventory, QuotaGovernor};
pub use routes::{classify, is_api_route, RoutePolicy};
pub use storage::{request_key, CacheNamespace, CachedSnapshot, ResponseSnapshot, SnapshotStore};
pub use strategy::{CacheStrategyEngine, FetchRequest};
