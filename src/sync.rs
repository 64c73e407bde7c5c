//! Flush scheduling for the durable mutation queue.
//!
//! The coordinator decides *when* the queue is drained and reports the
//! outcome. It never drains concurrently with itself: the queue's row-level
//! state is not built for two simultaneous passes, so an in-progress guard
//! coalesces triggers that arrive mid-flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::net::ReplayTransport;
use crate::queue::{MutationQueue, SyncReport};

/// Why a flush was requested, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// The platform reported an offline-to-online transition
  ConnectivityRestored,
  /// The application regained foreground visibility while online
  VisibilityRegained,
  /// Explicit user- or application-initiated request
  Manual,
  /// Passive timer, used only without event-driven deferred execution
  Periodic,
}

/// Visible sync state, rendered by the foreground indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
  Idle,
  Syncing,
  Completed {
    success: usize,
    failed: usize,
    total: usize,
  },
  Error {
    message: String,
  },
  Offline,
}

/// Messages delivered to the foreground over the status channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
  Sync(SyncStatus),
  /// Entries still awaiting delivery, for the backlog indicator
  Backlog { queued: u64 },
  /// Summary notification; sent only with the user's permission
  Notification { title: String, body: String },
}

/// Platform facility for scheduling work outside the foreground's control
/// (background-sync registration or an OS task scheduler). Absent on
/// platforms that only offer timers.
pub trait DeferredExecution {
  fn register(&self, tag: &str) -> Result<()>;
}

/// Tag under which queue drains are registered with the platform.
const SYNC_TAG: &str = "dialtone-sync";

/// Decides when the mutation queue is drained and surfaces results.
pub struct SyncCoordinator<T: ReplayTransport> {
  queue: Arc<MutationQueue>,
  transport: Arc<T>,
  status_tx: mpsc::UnboundedSender<StatusUpdate>,
  in_progress: AtomicBool,
  online: AtomicBool,
  notifications: bool,
  periodic_fallback: bool,
}

impl<T: ReplayTransport> SyncCoordinator<T> {
  /// Build the coordinator, attempting deferred-execution registration.
  /// When the platform offers none (or registration fails), the periodic
  /// timer is the permanent fallback for this session.
  pub fn new(
    queue: Arc<MutationQueue>,
    transport: Arc<T>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    config: &SyncConfig,
    platform: Option<&dyn DeferredExecution>,
  ) -> Self {
    let periodic_fallback = match platform {
      Some(platform) => match platform.register(SYNC_TAG) {
        Ok(()) => {
          info!(tag = SYNC_TAG, "registered for deferred sync");
          false
        }
        Err(e) => {
          info!("deferred sync registration failed, using periodic timer: {}", e);
          true
        }
      },
      None => {
        info!("no deferred execution available, using periodic timer");
        true
      }
    };

    Self {
      queue,
      transport,
      status_tx,
      in_progress: AtomicBool::new(false),
      online: AtomicBool::new(true),
      notifications: config.notifications,
      periodic_fallback,
    }
  }

  /// Whether this session drains on the passive timer.
  pub fn uses_periodic_fallback(&self) -> bool {
    self.periodic_fallback
  }

  /// Track connectivity. Going offline is announced on the status channel;
  /// coming back online is not announced here, since the caller follows up
  /// with a flush that reports its own outcome.
  pub fn set_online(&self, online: bool) {
    let was = self.online.swap(online, Ordering::SeqCst);
    if was && !online {
      self.send(StatusUpdate::Sync(SyncStatus::Offline));
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Announce initial state on the status channel.
  pub fn announce_startup(&self) {
    self.send(StatusUpdate::Sync(SyncStatus::Idle));
    self.emit_backlog();
  }

  /// Drain the queue once. Returns `None` when nothing was done: the queue
  /// was empty, the device is offline, or another flush is running (the
  /// running pass will pick up anything still eligible).
  pub async fn flush(&self, trigger: SyncTrigger) -> Option<SyncReport> {
    if self
      .in_progress
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!(?trigger, "flush already running, trigger coalesced");
      return None;
    }

    let result = self.run_flush(trigger).await;
    self.in_progress.store(false, Ordering::SeqCst);
    result
  }

  async fn run_flush(&self, trigger: SyncTrigger) -> Option<SyncReport> {
    if !self.is_online() {
      self.send(StatusUpdate::Sync(SyncStatus::Offline));
      return None;
    }

    // An empty queue surfaces no result at all
    match self.queue.is_empty() {
      Ok(true) => return None,
      Ok(false) => {}
      Err(e) => {
        warn!("queue inspection failed: {}", e);
        self.send(StatusUpdate::Sync(SyncStatus::Error {
          message: e.to_string(),
        }));
        return None;
      }
    }

    self.send(StatusUpdate::Sync(SyncStatus::Syncing));
    info!(?trigger, "draining mutation queue");

    match self.queue.process(self.transport.as_ref()).await {
      Ok(report) => {
        self.send(StatusUpdate::Sync(SyncStatus::Completed {
          success: report.success,
          failed: report.failed,
          total: report.total,
        }));
        self.emit_backlog();
        if self.notifications && report.total > 0 {
          self.send(StatusUpdate::Notification {
            title: "Dialtone sync".to_string(),
            body: format!("{} delivered, {} failed", report.success, report.failed),
          });
        }
        Some(report)
      }
      Err(e) => {
        warn!("queue drain failed: {}", e);
        self.send(StatusUpdate::Sync(SyncStatus::Error {
          message: e.to_string(),
        }));
        None
      }
    }
  }

  /// Push the current backlog size to the indicator.
  pub fn emit_backlog(&self) {
    match self.queue.stats() {
      Ok(stats) => self.send(StatusUpdate::Backlog {
        queued: stats.backlog(),
      }),
      Err(e) => warn!("queue stats failed: {}", e),
    }
  }

  /// The foreground may shut down and drop the receiver; status updates
  /// are then discarded.
  fn send(&self, update: StatusUpdate) {
    let _ = self.status_tx.send(update);
  }
}
