//! Install, update, and activation of the offline layer itself.
//!
//! Successive builds of the layer hand off without disrupting in-flight
//! cache or queue operations: a new version installs alongside an active
//! predecessor and waits for an explicit activation trigger (user consent,
//! or the predecessor releasing its last consumer). Activation happens
//! exactly once per version, prunes cache namespaces left by other
//! versions, and never touches the queue: queued mutations outlive the
//! version that captured them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{request_key, CacheNamespace, SnapshotStore};
use crate::net::FetchTransport;
use reqwest::Method;

/// Deployment state of one version of the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
  /// Not yet installed
  None,
  /// Precaching the application shell
  Installing,
  /// Installed, held back while an older version is still active
  InstalledWaiting,
  /// Serving all consumers
  Active,
}

/// How the layer runs on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
  /// Full background operation
  Background,
  /// The host cannot run the layer in the background; the application
  /// still works while it is in the foreground
  ForegroundOnly,
}

/// Report how the layer may run on this host. Registration failure is not
/// an error; it degrades to foreground-only operation.
pub fn register(host_supports_background: bool) -> Registration {
  if host_supports_background {
    Registration::Background
  } else {
    warn!("background execution unavailable, running foreground-only");
    Registration::ForegroundOnly
  }
}

/// Governs this build's install/update/activation.
pub struct LifecycleManager {
  version: String,
  state: VersionState,
  consumers_transitioned: bool,
  snapshots: Arc<SnapshotStore>,
}

impl LifecycleManager {
  pub fn new(snapshots: Arc<SnapshotStore>) -> Self {
    Self {
      version: snapshots.version().to_string(),
      state: VersionState::None,
      consumers_transitioned: false,
      snapshots,
    }
  }

  pub fn state(&self) -> VersionState {
    self.state
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Install this version: precache the application shell, then activate,
  /// unless an older version is still active, in which case this one is
  /// held in `InstalledWaiting` so requests and replays bound to the
  /// predecessor finish undisturbed.
  pub async fn install<T: FetchTransport>(
    &mut self,
    transport: &T,
    precache: &[String],
    predecessor_active: bool,
  ) -> VersionState {
    self.state = VersionState::Installing;
    info!(version = %self.version, "installing offline layer");

    for url in precache {
      match transport.fetch(&Method::GET, url, &[], None).await {
        Ok(snapshot) if snapshot.is_success() => {
          let key = request_key(Method::GET.as_str(), url);
          if let Err(e) = self.snapshots.put(CacheNamespace::Static, &key, url, &snapshot) {
            warn!(%url, "failed to precache: {}", e);
          }
        }
        Ok(snapshot) => warn!(%url, status = snapshot.status, "precache fetch rejected"),
        Err(e) => warn!(%url, "precache fetch failed: {}", e),
      }
    }

    if predecessor_active {
      self.state = VersionState::InstalledWaiting;
      info!(version = %self.version, "installed, waiting for predecessor to release");
    } else {
      self.activate();
    }

    self.state
  }

  /// Explicit activation trigger: user consent from an "update now"
  /// notification, or the natural absence of any other active consumer.
  /// Consumers transition exactly once; a repeated signal is ignored.
  pub fn activate(&mut self) -> bool {
    if self.consumers_transitioned {
      debug!(version = %self.version, "activation signal repeated, ignoring");
      return false;
    }
    self.consumers_transitioned = true;
    self.state = VersionState::Active;

    match self.snapshots.retain_version() {
      Ok(removed) if removed > 0 => {
        info!(removed, "pruned cache entries from previous versions");
      }
      Ok(_) => {}
      Err(e) => warn!("failed to prune previous cache versions: {}", e),
    }

    info!(version = %self.version, "offline layer active");
    true
  }

  /// The predecessor released its last consumer without an explicit
  /// consent signal.
  pub fn predecessor_gone(&mut self) -> bool {
    if self.state == VersionState::InstalledWaiting {
      self.activate()
    } else {
      false
    }
  }

  /// Best-effort update check against the backend's version manifest.
  /// Returns the remote version when it differs from this build. Failures
  /// are logged and retried on the next natural check, never fatal.
  pub async fn check_for_update<T: FetchTransport>(&self, transport: &T) -> Option<String> {
    let snapshot = match transport.fetch(&Method::GET, "/api", &[], None).await {
      Ok(snapshot) if snapshot.is_success() => snapshot,
      Ok(snapshot) => {
        warn!(status = snapshot.status, "update check rejected");
        return None;
      }
      Err(e) => {
        warn!("update check failed: {}", e);
        return None;
      }
    };

    let manifest: serde_json::Value = match serde_json::from_slice(&snapshot.body) {
      Ok(manifest) => manifest,
      Err(e) => {
        warn!("update manifest unreadable: {}", e);
        return None;
      }
    };

    let remote = manifest.get("version")?.as_str()?;
    if remote != self.version {
      info!(remote, current = %self.version, "update available");
      Some(remote.to_string())
    } else {
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::MutationBody;
  use crate::cache::ResponseSnapshot;
  use crate::store::Store;
  use async_trait::async_trait;
  use color_eyre::{eyre::eyre, Result};

  struct FakeTransport {
    body: &'static str,
    reachable: bool,
  }

  #[async_trait]
  impl FetchTransport for FakeTransport {
    async fn fetch(
      &self,
      _method: &Method,
      _url: &str,
      _headers: &[(String, String)],
      _body: Option<&MutationBody>,
    ) -> Result<ResponseSnapshot> {
      if !self.reachable {
        return Err(eyre!("connection refused"));
      }
      Ok(ResponseSnapshot {
        status: 200,
        headers: vec![],
        body: self.body.as_bytes().to_vec(),
      })
    }
  }

  fn manager() -> LifecycleManager {
    let snapshots = Arc::new(SnapshotStore::new(Store::open_in_memory().unwrap(), "0.2.0"));
    LifecycleManager::new(snapshots)
  }

  fn precache_urls() -> Vec<String> {
    vec!["/".to_string(), "/manifest.json".to_string()]
  }

  #[tokio::test]
  async fn test_install_without_predecessor_activates_and_precaches() {
    let mut manager = manager();
    let transport = FakeTransport { body: "shell", reachable: true };

    let state = manager.install(&transport, &precache_urls(), false).await;
    assert_eq!(state, VersionState::Active);

    let key = request_key("GET", "/");
    let cached = manager
      .snapshots
      .get(CacheNamespace::Static, &key)
      .unwrap()
      .unwrap();
    assert_eq!(cached.snapshot.body, b"shell");
  }

  #[tokio::test]
  async fn test_install_with_predecessor_waits_for_trigger() {
    let mut manager = manager();
    let transport = FakeTransport { body: "shell", reachable: true };

    let state = manager.install(&transport, &precache_urls(), true).await;
    assert_eq!(state, VersionState::InstalledWaiting);

    // Explicit trigger transitions consumers
    assert!(manager.activate());
    assert_eq!(manager.state(), VersionState::Active);
  }

  #[tokio::test]
  async fn test_repeated_activation_signal_transitions_once() {
    let mut manager = manager();
    let transport = FakeTransport { body: "shell", reachable: true };
    manager.install(&transport, &[], true).await;

    assert!(manager.activate());
    assert!(!manager.activate());
    assert!(!manager.predecessor_gone());
    assert_eq!(manager.state(), VersionState::Active);
  }

  #[tokio::test]
  async fn test_predecessor_gone_activates_only_from_waiting() {
    let mut manager = manager();
    assert!(!manager.predecessor_gone());

    let transport = FakeTransport { body: "shell", reachable: true };
    manager.install(&transport, &[], true).await;
    assert!(manager.predecessor_gone());
    assert_eq!(manager.state(), VersionState::Active);
  }

  #[tokio::test]
  async fn test_install_survives_unreachable_network() {
    let mut manager = manager();
    let transport = FakeTransport { body: "", reachable: false };

    // Precaching is best-effort; installation itself proceeds
    let state = manager.install(&transport, &precache_urls(), false).await;
    assert_eq!(state, VersionState::Active);
  }

  #[tokio::test]
  async fn test_activation_prunes_other_version_namespaces() {
    let shared = Store::open_in_memory().unwrap();
    let old = SnapshotStore::new(shared.clone(), "0.1.0");
    let key = request_key("GET", "/");
    old
      .put(CacheNamespace::Static, &key, "/", &ResponseSnapshot {
        status: 200,
        headers: vec![],
        body: b"old shell".to_vec(),
      })
      .unwrap();

    let snapshots = Arc::new(SnapshotStore::new(shared, "0.2.0"));
    let mut manager = LifecycleManager::new(Arc::clone(&snapshots));
    let transport = FakeTransport { body: "new shell", reachable: true };
    manager.install(&transport, &precache_urls(), false).await;

    assert!(old.get(CacheNamespace::Static, &key).unwrap().is_none());
    assert!(snapshots.get(CacheNamespace::Static, &key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_update_check_reports_newer_version_only() {
    let manager = manager();

    let newer = FakeTransport { body: r#"{"name":"Dialtone Voice Notes API","version":"0.3.0"}"#, reachable: true };
    assert_eq!(manager.check_for_update(&newer).await, Some("0.3.0".to_string()));

    let same = FakeTransport { body: r#"{"version":"0.2.0"}"#, reachable: true };
    assert_eq!(manager.check_for_update(&same).await, None);

    let offline = FakeTransport { body: "", reachable: false };
    assert_eq!(manager.check_for_update(&offline).await, None);
  }

  #[test]
  fn test_registration_degrades_to_foreground_only() {
    assert_eq!(register(true), Registration::Background);
    assert_eq!(register(false), Registration::ForegroundOnly);
  }
}
