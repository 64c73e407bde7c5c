//! Core runtime wiring and the event-dispatch interface.
//!
//! The agent owns one instance of every component, built from a single
//! [`Config`] and a single [`Store`] at startup. Hosts drive it through
//! exactly two surfaces: [`Agent::intercept`] for outgoing requests and
//! [`Agent::handle_event`] for platform signals. The status channel flows
//! the other way.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::{
  CacheStrategyEngine, FetchRequest, QuotaGovernor, ResponseSnapshot, SnapshotStore,
};
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::lifecycle::{register, LifecycleManager, Registration};
use crate::net::{FetchTransport, HttpClient, ReplayTransport};
use crate::queue::MutationQueue;
use crate::store::Store;
use crate::sync::{DeferredExecution, StatusUpdate, SyncCoordinator, SyncTrigger};

/// Ticks between best-effort update checks.
const UPDATE_CHECK_TICKS: u64 = 60;

/// What the hosting platform offers the layer.
pub struct HostCapabilities {
  /// Whether the host can run the layer in the background at all
  pub background: bool,
  /// Event-driven deferred execution, when the platform has one
  pub deferred: Option<Box<dyn DeferredExecution + Send + Sync>>,
  /// An older build of the layer is still attached to consumers
  pub predecessor_active: bool,
}

impl Default for HostCapabilities {
  fn default() -> Self {
    Self {
      background: true,
      deferred: None,
      predecessor_active: false,
    }
  }
}

/// The assembled offline layer.
pub struct Agent<T: FetchTransport + ReplayTransport + 'static> {
  engine: CacheStrategyEngine<T>,
  coordinator: SyncCoordinator<T>,
  lifecycle: LifecycleManager,
  queue: Arc<MutationQueue>,
  transport: Arc<T>,
  status_tx: mpsc::UnboundedSender<StatusUpdate>,
  registration: Registration,
  predecessor_active: bool,
  precache: Vec<String>,
  poll_interval: Duration,
  ticks: u64,
}

impl Agent<HttpClient> {
  /// Build the full layer from configuration, opening the default store.
  pub fn new(
    config: Config,
    host: HostCapabilities,
  ) -> Result<(Self, mpsc::UnboundedReceiver<StatusUpdate>)> {
    let transport = Arc::new(HttpClient::new(&config.backend)?);
    Self::from_parts(config, host, Store::open()?, transport)
  }
}

impl<T: FetchTransport + ReplayTransport + 'static> Agent<T> {
  /// Assemble the layer over an explicit store and transport.
  pub fn from_parts(
    config: Config,
    host: HostCapabilities,
    store: Store,
    transport: Arc<T>,
  ) -> Result<(Self, mpsc::UnboundedReceiver<StatusUpdate>)> {
    let registration = register(host.background);

    let snapshots = Arc::new(SnapshotStore::new(store.clone(), env!("CARGO_PKG_VERSION")));
    let governor = Arc::new(QuotaGovernor::new(&config.cache));
    let queue = Arc::new(MutationQueue::new(store, &config.queue));

    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let deferred = host.deferred.as_deref().map(|d| d as &dyn DeferredExecution);
    let coordinator = SyncCoordinator::new(
      Arc::clone(&queue),
      Arc::clone(&transport),
      status_tx.clone(),
      &config.sync,
      deferred,
    );

    let engine = CacheStrategyEngine::new(
      Arc::clone(&snapshots),
      governor,
      Arc::clone(&queue),
      Arc::clone(&transport),
    );
    let lifecycle = LifecycleManager::new(snapshots);

    let agent = Self {
      engine,
      coordinator,
      lifecycle,
      queue,
      transport,
      status_tx,
      registration,
      predecessor_active: host.predecessor_active,
      precache: config.sync.precache.clone(),
      poll_interval: config.sync.poll_interval(),
      ticks: 0,
    };

    Ok((agent, status_rx))
  }

  /// How this layer runs on the current host.
  pub fn registration(&self) -> Registration {
    self.registration
  }

  pub fn poll_interval(&self) -> Duration {
    self.poll_interval
  }

  /// Install this version and announce initial state.
  pub async fn start(&mut self) {
    self
      .lifecycle
      .install(
        self.transport.as_ref(),
        &self.precache,
        self.predecessor_active,
      )
      .await;
    self.coordinator.announce_startup();
  }

  /// Serve one intercepted request through the per-route cache strategy.
  pub async fn intercept(&self, request: FetchRequest) -> ResponseSnapshot {
    let response = self.engine.handle(request).await;
    if response.status == 202 {
      // A mutation just entered the queue; keep the indicator current
      self.coordinator.emit_backlog();
    }
    response
  }

  /// Dispatch one host signal. This is the whole control surface: the
  /// layer never assumes it drives its own process lifecycle.
  pub async fn handle_event(&mut self, event: Event) {
    match event {
      Event::Connectivity(online) => {
        self.coordinator.set_online(online);
        if online {
          self.coordinator.flush(SyncTrigger::ConnectivityRestored).await;
        }
      }
      Event::Visibility(visible) => {
        if visible && self.coordinator.is_online() {
          self.coordinator.flush(SyncTrigger::VisibilityRegained).await;
        }
      }
      Event::FlushRequested => {
        // An explicit request also resubmits terminally-failed entries
        match self.queue.retry_failed() {
          Ok(reset) if reset > 0 => info!(reset, "resubmitting failed mutations"),
          Ok(_) => {}
          Err(e) => warn!("failed-entry reset failed: {}", e),
        }
        self.coordinator.flush(SyncTrigger::Manual).await;
      }
      Event::Tick => self.tick().await,
      Event::Shutdown => {}
    }
  }

  async fn tick(&mut self) {
    self.ticks += 1;

    if let Err(e) = self.queue.sweep() {
      warn!("queue sweep failed: {}", e);
    }

    if self.coordinator.uses_periodic_fallback() && self.coordinator.is_online() {
      self.coordinator.flush(SyncTrigger::Periodic).await;
    }

    if self.ticks % UPDATE_CHECK_TICKS == 0 {
      if let Some(version) = self.lifecycle.check_for_update(self.transport.as_ref()).await {
        let _ = self.status_tx.send(StatusUpdate::Notification {
          title: "Update available".to_string(),
          body: format!(
            "Dialtone {} is ready. Update now to switch to the new version.",
            version
          ),
        });
      }
    }
  }

  /// Drive the agent from an event stream until the host shuts it down.
  pub async fn run(&mut self, events: &mut EventHandler) -> Result<()> {
    info!(
      version = self.lifecycle.version(),
      registration = ?self.registration,
      "offline agent running"
    );

    while let Some(event) = events.next().await {
      if event == Event::Shutdown {
        info!("shutting down");
        break;
      }
      self.handle_event(event).await;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{MutationBody, QueuedMutation};
  use async_trait::async_trait;
  use color_eyre::eyre::eyre;
  use reqwest::Method;
  use std::sync::atomic::{AtomicBool, Ordering};

  /// Transport whose reachability can be toggled mid-test.
  struct SwitchedTransport {
    online: AtomicBool,
  }

  impl SwitchedTransport {
    fn offline() -> Self {
      Self {
        online: AtomicBool::new(false),
      }
    }

    fn set_online(&self, online: bool) {
      self.online.store(online, Ordering::SeqCst);
    }
  }

  #[async_trait]
  impl FetchTransport for SwitchedTransport {
    async fn fetch(
      &self,
      _method: &Method,
      _url: &str,
      _headers: &[(String, String)],
      _body: Option<&MutationBody>,
    ) -> Result<ResponseSnapshot> {
      if !self.online.load(Ordering::SeqCst) {
        return Err(eyre!("network unreachable"));
      }
      Ok(ResponseSnapshot {
        status: 200,
        headers: vec![],
        body: b"ok".to_vec(),
      })
    }
  }

  #[async_trait]
  impl ReplayTransport for SwitchedTransport {
    async fn replay(&self, _mutation: &QueuedMutation) -> Result<u16> {
      if !self.online.load(Ordering::SeqCst) {
        return Err(eyre!("network unreachable"));
      }
      Ok(200)
    }
  }

  fn agent() -> (
    Agent<SwitchedTransport>,
    Arc<SwitchedTransport>,
    mpsc::UnboundedReceiver<StatusUpdate>,
  ) {
    let config: Config =
      serde_yaml::from_str("backend:\n  url: http://localhost:8000\n").unwrap();
    let transport = Arc::new(SwitchedTransport::offline());
    let (agent, status_rx) = Agent::from_parts(
      config,
      HostCapabilities::default(),
      Store::open_in_memory().unwrap(),
      Arc::clone(&transport),
    )
    .unwrap();
    (agent, transport, status_rx)
  }

  #[tokio::test]
  async fn test_offline_mutations_flush_when_connectivity_returns() {
    let (mut agent, transport, _status_rx) = agent();
    agent.handle_event(Event::Connectivity(false)).await;

    // Three mutations submitted while offline are all queued
    for i in 0..3 {
      let response = agent
        .intercept(FetchRequest::mutation(
          Method::POST,
          format!("/api/v1/sessions/{}", i),
          Some(MutationBody::Json { text: "{}".to_string() }),
        ))
        .await;
      assert_eq!(response.status, 202);
    }
    assert_eq!(agent.queue.stats().unwrap().pending, 3);

    // The device comes back online and the coordinator drains the queue
    transport.set_online(true);
    agent.handle_event(Event::Connectivity(true)).await;
    assert!(agent.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_status_channel_reports_the_flush() {
    let (mut agent, transport, mut status_rx) = agent();
    agent.handle_event(Event::Connectivity(false)).await;
    agent
      .intercept(FetchRequest::mutation(Method::POST, "/api/v1/vault/save", None))
      .await;

    transport.set_online(true);
    agent.handle_event(Event::Connectivity(true)).await;

    let mut saw_completed = false;
    while let Ok(update) = status_rx.try_recv() {
      if let StatusUpdate::Sync(crate::sync::SyncStatus::Completed { success, failed, total }) =
        update
      {
        assert_eq!((success, failed, total), (1, 0, 1));
        saw_completed = true;
      }
    }
    assert!(saw_completed);
  }

  #[tokio::test]
  async fn test_visibility_regained_flushes_only_while_online() {
    let (mut agent, transport, _status_rx) = agent();
    agent.handle_event(Event::Connectivity(false)).await;
    agent
      .intercept(FetchRequest::mutation(Method::POST, "/api/v1/vault/save", None))
      .await;

    // Visible but offline: nothing drains
    agent.handle_event(Event::Visibility(true)).await;
    assert_eq!(agent.queue.len().unwrap(), 1);

    // Transport recovers without a connectivity event; foregrounding while
    // online picks the queue up
    transport.set_online(true);
    agent.handle_event(Event::Connectivity(true)).await;
    assert!(agent.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_foreground_only_registration_is_reported() {
    let config: Config =
      serde_yaml::from_str("backend:\n  url: http://localhost:8000\n").unwrap();
    let (agent, _status_rx) = Agent::from_parts(
      config,
      HostCapabilities {
        background: false,
        ..HostCapabilities::default()
      },
      Store::open_in_memory().unwrap(),
      Arc::new(SwitchedTransport::offline()),
    )
    .unwrap();

    assert_eq!(agent.registration(), Registration::ForegroundOnly);
  }
}
