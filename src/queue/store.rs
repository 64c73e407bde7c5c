//! SQLite persistence for the mutation queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Row};

use crate::store::{format_datetime, parse_datetime, Store};

use super::{MutationStatus, QueueStats, QueuedMutation};

/// Row-level operations on the `mutation_queue` table. Status transitions
/// and retry scheduling live in [`super::MutationQueue`]; this type only
/// moves entries in and out of storage.
pub struct QueueStore {
  store: Store,
}

impl QueueStore {
  pub fn new(store: Store) -> Self {
    Self { store }
  }

  /// Number of entries, any status.
  pub fn count(&self) -> Result<u64> {
    let conn = self.store.lock()?;
    conn
      .query_row("SELECT COUNT(*) FROM mutation_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue entries: {}", e))
  }

  /// Insert a new pending entry and return its id.
  pub fn insert(
    &self,
    url: &str,
    method: &str,
    headers: &[(String, String)],
    body: &str,
    now: DateTime<Utc>,
  ) -> Result<i64> {
    let conn = self.store.lock()?;
    let headers_json =
      serde_json::to_string(headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let timestamp = format_datetime(now);

    conn
      .execute(
        "INSERT INTO mutation_queue (url, method, headers, body, queued_at, attempts, next_retry_at, status)
         VALUES (?, ?, ?, ?, ?, 0, ?, 'pending')",
        params![url, method, headers_json, body, timestamp, timestamp],
      )
      .map_err(|e| eyre!("Failed to insert queue entry: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  /// Remove the single oldest entry by enqueue timestamp.
  pub fn evict_oldest(&self) -> Result<Option<i64>> {
    let conn = self.store.lock()?;

    let oldest: Option<i64> = conn
      .query_row(
        "SELECT id FROM mutation_queue ORDER BY queued_at, id LIMIT 1",
        [],
        |row| row.get(0),
      )
      .ok();

    if let Some(id) = oldest {
      conn
        .execute("DELETE FROM mutation_queue WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to evict queue entry: {}", e))?;
    }

    Ok(oldest)
  }

  /// Entries eligible for replay: pending or retrying, attempts below the
  /// maximum, retry timestamp due. Returned in enqueue order.
  pub fn due(&self, now: DateTime<Utc>, max_attempts: u32) -> Result<Vec<QueuedMutation>> {
    let conn = self.store.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, queued_at, attempts, next_retry_at, status
         FROM mutation_queue
         WHERE status IN ('pending', 'retrying') AND attempts < ? AND next_retry_at <= ?
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare due query: {}", e))?;

    let rows = stmt
      .query_map(params![max_attempts, format_datetime(now)], row_to_entry)
      .map_err(|e| eyre!("Failed to query due entries: {}", e))?;

    let mut entries = Vec::new();
    for row in rows {
      let raw = row.map_err(|e| eyre!("Failed to read queue row: {}", e))?;
      entries.push(raw?);
    }

    Ok(entries)
  }

  /// Fetch one entry by id.
  pub fn get(&self, id: i64) -> Result<Option<QueuedMutation>> {
    let conn = self.store.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, queued_at, attempts, next_retry_at, status
         FROM mutation_queue WHERE id = ?",
      )
      .map_err(|e| eyre!("Failed to prepare get query: {}", e))?;

    match stmt.query_row(params![id], row_to_entry) {
      Ok(entry) => Ok(Some(entry?)),
      Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
      Err(e) => Err(eyre!("Failed to fetch queue entry {}: {}", id, e)),
    }
  }

  /// Delete an entry after successful replay.
  pub fn delete(&self, id: i64) -> Result<()> {
    let conn = self.store.lock()?;
    conn
      .execute("DELETE FROM mutation_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete queue entry {}: {}", id, e))?;
    Ok(())
  }

  /// Record a failed replay attempt.
  pub fn record_failure(
    &self,
    id: i64,
    attempts: u32,
    status: MutationStatus,
    next_retry_at: DateTime<Utc>,
  ) -> Result<()> {
    let conn = self.store.lock()?;
    conn
      .execute(
        "UPDATE mutation_queue SET attempts = ?, status = ?, next_retry_at = ? WHERE id = ?",
        params![attempts, status.as_str(), format_datetime(next_retry_at), id],
      )
      .map_err(|e| eyre!("Failed to update queue entry {}: {}", id, e))?;
    Ok(())
  }

  /// Reset terminally-failed entries for another round of delivery attempts.
  pub fn reset_failed(&self, now: DateTime<Utc>) -> Result<usize> {
    let conn = self.store.lock()?;
    let reset = conn
      .execute(
        "UPDATE mutation_queue SET status = 'pending', attempts = 0, next_retry_at = ?
         WHERE status = 'failed'",
        params![format_datetime(now)],
      )
      .map_err(|e| eyre!("Failed to reset failed entries: {}", e))?;
    Ok(reset)
  }

  /// Remove entries enqueued before the cutoff, regardless of status.
  pub fn sweep(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.store.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM mutation_queue WHERE queued_at < ?",
        params![format_datetime(cutoff)],
      )
      .map_err(|e| eyre!("Failed to sweep queue: {}", e))?;
    Ok(removed)
  }

  /// Per-status counts.
  pub fn stats(&self) -> Result<QueueStats> {
    let conn = self.store.lock()?;

    let mut stmt = conn
      .prepare("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")
      .map_err(|e| eyre!("Failed to prepare stats query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        let status: String = row.get(0)?;
        let count: u64 = row.get(1)?;
        Ok((status, count))
      })
      .map_err(|e| eyre!("Failed to query stats: {}", e))?;

    let mut stats = QueueStats::default();
    for row in rows {
      let (status, count) = row.map_err(|e| eyre!("Failed to read stats row: {}", e))?;
      match status.as_str() {
        "pending" => stats.pending = count,
        "retrying" => stats.retrying = count,
        "failed" => stats.failed = count,
        other => return Err(eyre!("Unknown queue status in storage: {}", other)),
      }
      stats.total += count;
    }

    Ok(stats)
  }

  /// Rewrite an entry's enqueue timestamp. Test hook for age-sweep coverage.
  #[cfg(test)]
  pub fn backdate(&self, id: i64, queued_at: DateTime<Utc>) -> Result<()> {
    let conn = self.store.lock()?;
    conn
      .execute(
        "UPDATE mutation_queue SET queued_at = ? WHERE id = ?",
        params![format_datetime(queued_at), id],
      )
      .map_err(|e| eyre!("Failed to backdate entry {}: {}", id, e))?;
    Ok(())
  }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Result<QueuedMutation>> {
  let id: i64 = row.get(0)?;
  let url: String = row.get(1)?;
  let method: String = row.get(2)?;
  let headers_json: String = row.get(3)?;
  let body_json: String = row.get(4)?;
  let queued_at: String = row.get(5)?;
  let attempts: u32 = row.get(6)?;
  let next_retry_at: String = row.get(7)?;
  let status: String = row.get(8)?;

  Ok(build_entry(
    id,
    url,
    method,
    headers_json,
    body_json,
    queued_at,
    attempts,
    next_retry_at,
    status,
  ))
}

#[allow(clippy::too_many_arguments)]
fn build_entry(
  id: i64,
  url: String,
  method: String,
  headers_json: String,
  body_json: String,
  queued_at: String,
  attempts: u32,
  next_retry_at: String,
  status: String,
) -> Result<QueuedMutation> {
  Ok(QueuedMutation {
    id,
    url,
    method,
    headers: serde_json::from_str(&headers_json)
      .map_err(|e| eyre!("Failed to parse stored headers: {}", e))?,
    body: serde_json::from_str(&body_json)
      .map_err(|e| eyre!("Failed to parse stored body: {}", e))?,
    queued_at: parse_datetime(&queued_at)?,
    attempts,
    next_retry_at: parse_datetime(&next_retry_at)?,
    status: MutationStatus::parse(&status)?,
  })
}
