//! Durable queue of mutation requests awaiting delivery.
//!
//! Mutations that cannot reach the network are captured here in replayable
//! form and survive process restarts. Delivery is at-least-once: each entry
//! is retried with a fixed backoff schedule until it succeeds, exhausts its
//! attempts, or ages out of the retention window.

mod body;
mod store;

pub use body::{FormField, MutationBody};
pub use store::QueueStore;

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::net::ReplayTransport;
use crate::store::Store;

/// A mutation captured for later delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
  pub id: i64,
  pub url: String,
  pub method: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<MutationBody>,
  pub queued_at: DateTime<Utc>,
  pub attempts: u32,
  pub next_retry_at: DateTime<Utc>,
  pub status: MutationStatus,
}

/// Delivery state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  /// Never attempted, or reset for manual retry
  Pending,
  /// Failed at least once, scheduled for another attempt
  Retrying,
  /// Exhausted its attempts; retained until swept or manually reset
  Failed,
}

impl MutationStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Retrying => "retrying",
      Self::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "retrying" => Ok(Self::Retrying),
      "failed" => Ok(Self::Failed),
      other => Err(eyre!("Unknown mutation status: {}", other)),
    }
  }
}

/// Per-status entry counts, surfaced to the UI backlog indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub pending: u64,
  pub retrying: u64,
  pub failed: u64,
  pub total: u64,
}

impl QueueStats {
  /// Entries still awaiting delivery.
  pub fn backlog(&self) -> u64 {
    self.pending + self.retrying
  }
}

/// Outcome of one queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub success: usize,
  pub failed: usize,
  pub total: usize,
}

/// The durable mutation queue.
pub struct MutationQueue {
  store: QueueStore,
  max_entries: usize,
  max_attempts: u32,
  backoff: Vec<Duration>,
  max_age: Duration,
}

impl MutationQueue {
  pub fn new(store: Store, config: &QueueConfig) -> Self {
    let backoff = if config.backoff_secs.is_empty() {
      vec![Duration::seconds(1)]
    } else {
      config
        .backoff_secs
        .iter()
        .map(|&s| Duration::seconds(s as i64))
        .collect()
    };

    Self {
      store: QueueStore::new(store),
      max_entries: config.max_entries,
      max_attempts: config.max_attempts.max(1),
      backoff,
      max_age: Duration::days(config.max_age_days),
    }
  }

  /// Capture a mutation for later delivery.
  ///
  /// At capacity, the single oldest entry is evicted first: a newly queued
  /// mutation is never rejected in favor of preserving an older one.
  pub fn enqueue(
    &self,
    url: &str,
    method: &str,
    headers: &[(String, String)],
    body: Option<MutationBody>,
  ) -> Result<i64> {
    let body_json =
      serde_json::to_string(&body).map_err(|e| eyre!("Failed to serialize body: {}", e))?;

    while self.store.count()? as usize >= self.max_entries {
      if let Some(evicted) = self.store.evict_oldest()? {
        warn!(evicted, "queue at capacity, evicted oldest entry");
      } else {
        break;
      }
    }

    let id = self.store.insert(url, method, headers, &body_json, Utc::now())?;
    debug!(id, method, url, "queued mutation");

    Ok(id)
  }

  /// Replay every eligible entry in enqueue order.
  ///
  /// Outcomes are independent: one entry's failure does not block or roll
  /// back another's success.
  pub async fn process<T: ReplayTransport + ?Sized>(&self, transport: &T) -> Result<SyncReport> {
    let now = Utc::now();
    let due = self.store.due(now, self.max_attempts)?;

    let mut report = SyncReport {
      total: due.len(),
      ..SyncReport::default()
    };

    for entry in due {
      match transport.replay(&entry).await {
        Ok(status) if (200..300).contains(&status) => {
          self.store.delete(entry.id)?;
          report.success += 1;
          debug!(id = entry.id, status, "replayed mutation");
        }
        outcome => {
          match outcome {
            Ok(status) => debug!(id = entry.id, status, "replay rejected by backend"),
            Err(e) => debug!(id = entry.id, "replay failed: {}", e),
          }
          self.schedule_retry(&entry, now)?;
          report.failed += 1;
        }
      }
    }

    Ok(report)
  }

  fn schedule_retry(&self, entry: &QueuedMutation, now: DateTime<Utc>) -> Result<()> {
    let attempts = entry.attempts + 1;

    if attempts >= self.max_attempts {
      // Terminal: retained for statistics and the age sweep, never
      // retried automatically
      warn!(id = entry.id, attempts, "mutation exhausted its attempts");
      return self
        .store
        .record_failure(entry.id, attempts, MutationStatus::Failed, now);
    }

    // The last configured delay is reused for any further attempt
    let delay = self.backoff[(attempts as usize - 1).min(self.backoff.len() - 1)];
    self
      .store
      .record_failure(entry.id, attempts, MutationStatus::Retrying, now + delay)
  }

  /// Remove entries older than the retention window, regardless of status.
  pub fn sweep(&self) -> Result<usize> {
    let removed = self.store.sweep(Utc::now() - self.max_age)?;
    if removed > 0 {
      info!(removed, "swept expired queue entries");
    }
    Ok(removed)
  }

  /// Reset terminally-failed entries so the next drain retries them.
  pub fn retry_failed(&self) -> Result<usize> {
    self.store.reset_failed(Utc::now())
  }

  pub fn stats(&self) -> Result<QueueStats> {
    self.store.stats()
  }

  pub fn len(&self) -> Result<u64> {
    self.store.count()
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  #[cfg(test)]
  pub(crate) fn store(&self) -> &QueueStore {
    &self.store
  }
}
