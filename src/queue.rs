//! Durable message queue
//!
//! Every message between server and agents is persisted here before it is
//! acted on, so delivery survives agent disconnects, server restarts, and
//! partial failures. Rows move through a small state machine:
//!
//! ```text
//! PENDING -> IN_PROGRESS -> {COMPLETED | FAILED}
//! {PENDING, IN_PROGRESS} -> EXPIRED
//! ```
//!
//! No other transition exists. The claim in [`ServerMessageQueue::mark_processing`]
//! is a conditional UPDATE, which is the only guard two workers need against
//! processing the same row twice.

use crate::domain_types::HostId;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const INSERT_MESSAGE: &str = "\
INSERT OR IGNORE INTO message_queue \
    (message_id, host_id, direction, message_type, message_data, priority, status, created_at) \
VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)";

const ENTRY_COLUMNS: &str = "\
message_id, host_id, direction, message_type, message_data, priority, status, \
created_at, started_at, completed_at, expired_at, retry_count, max_retries, error_message";

/// Errors from queue persistence
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt queue row {message_id}: {message}")]
    Corrupt { message_id: String, message: String },
}

/// Direction of a queued message relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    Inbound,
    Outbound,
}

impl QueueDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Lifecycle state of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl QueueStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Dispatch priority. Higher values dequeue first; FIFO within a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl QueuePriority {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }

    fn from_i64(value: i64) -> Self {
        match value {
            0 => Self::Low,
            2 => Self::High,
            3 => Self::Urgent,
            _ => Self::Normal,
        }
    }
}

/// Queue rows reference their host explicitly: either a known host id, or
/// not-yet-registered (a SYSTEM_INFO can arrive before the host row exists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRef {
    Known(HostId),
    Unregistered,
}

impl HostRef {
    #[must_use]
    pub fn host_id(self) -> Option<HostId> {
        match self {
            Self::Known(id) => Some(id),
            Self::Unregistered => None,
        }
    }

    fn as_db(self) -> Option<String> {
        self.host_id().map(|id| id.to_string())
    }
}

/// One persisted message
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub message_id: Uuid,
    pub host: HostRef,
    pub direction: QueueDirection,
    pub message_type: String,
    pub message_data: String,
    pub priority: QueuePriority,
    pub status: QueueStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub expired_at: Option<i64>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,
}

impl QueueEntry {
    fn from_row(row: &SqliteRow) -> Result<Self, QueueError> {
        let message_id_text: String = row.get("message_id");
        let message_id =
            Uuid::parse_str(&message_id_text).map_err(|e| QueueError::Corrupt {
                message_id: message_id_text.clone(),
                message: format!("invalid message id: {e}"),
            })?;
        let host = match row.get::<Option<String>, _>("host_id") {
            Some(text) => HostRef::Known(HostId::parse(&text).map_err(|e| QueueError::Corrupt {
                message_id: message_id_text.clone(),
                message: format!("invalid host id '{text}': {e}"),
            })?),
            None => HostRef::Unregistered,
        };
        let direction = match row.get::<String, _>("direction").as_str() {
            "outbound" => QueueDirection::Outbound,
            _ => QueueDirection::Inbound,
        };
        let status_text: String = row.get("status");
        let status = QueueStatus::parse(&status_text).ok_or_else(|| QueueError::Corrupt {
            message_id: message_id_text.clone(),
            message: format!("unknown status '{status_text}'"),
        })?;

        Ok(Self {
            message_id,
            host,
            direction,
            message_type: row.get("message_type"),
            message_data: row.get("message_data"),
            priority: QueuePriority::from_i64(row.get("priority")),
            status,
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            expired_at: row.get("expired_at"),
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            error_message: row.get("error_message"),
        })
    }
}

/// Per-status row counts for observability
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub expired: i64,
}

/// The server side of the durable queue
#[derive(Clone)]
pub struct ServerMessageQueue {
    pool: SqlitePool,
}

impl ServerMessageQueue {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persists a message. Re-enqueueing the same `message_id` for the same
    /// direction is a duplicate and is ignored, which makes delivery
    /// at-most-once end to end.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or unserializable payloads.
    #[instrument(skip(self, message_data), fields(message_id = %message_id, message_type))]
    pub async fn enqueue(
        &self,
        message_id: Uuid,
        message_type: &str,
        message_data: &Value,
        direction: QueueDirection,
        host: HostRef,
        priority: QueuePriority,
    ) -> Result<Uuid, QueueError> {
        let serialized = serde_json::to_string(message_data)?;
        let result = sqlx::query(INSERT_MESSAGE)
            .bind(message_id.to_string())
            .bind(host.as_db())
            .bind(direction.as_str())
            .bind(message_type)
            .bind(serialized)
            .bind(priority.as_i64())
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(%message_id, "duplicate enqueue ignored");
        }
        Ok(message_id)
    }

    /// Returns PENDING rows for a host in dispatch order: priority
    /// descending, FIFO within a priority. Expired rows never come back.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn dequeue_for_host(
        &self,
        host_id: HostId,
        direction: QueueDirection,
        limit: u32,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM message_queue \
             WHERE host_id = ? AND direction = ? AND status = 'pending' AND expired_at IS NULL \
             ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(host_id.to_string())
            .bind(direction.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(QueueEntry::from_row).collect()
    }

    /// Returns PENDING inbound rows that carry no host id yet
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn pending_unregistered(&self, limit: u32) -> Result<Vec<QueueEntry>, QueueError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM message_queue \
             WHERE host_id IS NULL AND direction = 'inbound' AND status = 'pending' \
               AND expired_at IS NULL \
             ORDER BY created_at ASC, rowid ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(QueueEntry::from_row).collect()
    }

    /// Distinct hosts that have at least one PENDING row in `direction`
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn hosts_with_pending(
        &self,
        direction: QueueDirection,
        limit: u32,
    ) -> Result<Vec<HostId>, QueueError> {
        let rows = sqlx::query(
            "SELECT DISTINCT host_id FROM message_queue \
             WHERE direction = ? AND status = 'pending' AND host_id IS NOT NULL \
               AND expired_at IS NULL LIMIT ?",
        )
        .bind(direction.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut hosts = Vec::with_capacity(rows.len());
        for row in &rows {
            let text: String = row.get("host_id");
            hosts.push(HostId::parse(&text).map_err(|e| QueueError::Corrupt {
                message_id: String::new(),
                message: format!("invalid host id '{text}': {e}"),
            })?);
        }
        Ok(hosts)
    }

    /// Atomically claims a PENDING row for processing. Returns `false` when
    /// the row is no longer PENDING, in which case the caller must skip it:
    /// another worker owns it.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn mark_processing(&self, message_id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE message_queue SET status = 'in_progress', started_at = ? \
             WHERE message_id = ? AND status = 'pending'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Completes an IN_PROGRESS row. Duplicate completions are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn mark_completed(&self, message_id: Uuid) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE message_queue SET status = 'completed', completed_at = ? \
             WHERE message_id = ? AND status = 'in_progress'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fails a row terminally. PENDING rows may be failed directly for
    /// structural problems found before dispatch (missing host, unapproved
    /// host); otherwise failures come from IN_PROGRESS.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn mark_failed(&self, message_id: Uuid, error_message: &str) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE message_queue SET status = 'failed', completed_at = ?, error_message = ? \
             WHERE message_id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(error_message)
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Releases a claimed row back to PENDING, clearing `started_at`. Used
    /// when delivery could not be attempted after all (transport gone); the
    /// row becomes eligible for the next dispatch pass.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn release(&self, message_id: Uuid) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE message_queue SET status = 'pending', started_at = NULL \
             WHERE message_id = ? AND status = 'in_progress'",
        )
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resets IN_PROGRESS rows whose claim is older than `threshold_secs`
    /// back to PENDING, clearing `started_at`. Bounds work-loss on a crashed
    /// worker to one sweep interval.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn reset_stuck_messages(&self, threshold_secs: u64) -> Result<u64, QueueError> {
        let threshold_ms = i64::try_from(threshold_secs).unwrap_or(i64::MAX / 1000) * 1000;
        let cutoff = Utc::now().timestamp_millis() - threshold_ms;
        let result = sqlx::query(
            "UPDATE message_queue SET status = 'pending', started_at = NULL \
             WHERE status = 'in_progress' AND started_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected();
        if count > 0 {
            warn!(count, "reset stuck in-progress messages to pending");
        }
        Ok(count)
    }

    /// Expires PENDING/IN_PROGRESS rows older than `timeout_minutes`.
    /// Expired rows are never dispatched again; they persist for
    /// observability until cleanup.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn expire_old_messages(&self, timeout_minutes: u64) -> Result<u64, QueueError> {
        let timeout_ms = i64::try_from(timeout_minutes).unwrap_or(i64::MAX / 60_000) * 60_000;
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE message_queue \
             SET status = 'expired', expired_at = ?, error_message = ? \
             WHERE created_at < ? AND status IN ('pending', 'in_progress') \
               AND expired_at IS NULL",
        )
        .bind(now)
        .bind(format!("Message expired after {timeout_minutes} minutes"))
        .bind(now - timeout_ms)
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected();
        if count > 0 {
            info!(count, timeout_minutes, "marked old messages as expired");
        }
        Ok(count)
    }

    /// Deletes COMPLETED rows (and FAILED rows, unless `keep_failed`) whose
    /// terminal timestamp is older than `older_than_days`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn cleanup_old_messages(
        &self,
        older_than_days: u64,
        keep_failed: bool,
    ) -> Result<u64, QueueError> {
        let days_ms = i64::try_from(older_than_days).unwrap_or(i64::MAX / 86_400_000) * 86_400_000;
        let cutoff = Utc::now().timestamp_millis() - days_ms;
        let sql = if keep_failed {
            "DELETE FROM message_queue WHERE completed_at < ? AND status = 'completed'"
        } else {
            "DELETE FROM message_queue WHERE completed_at < ? AND status IN ('completed', 'failed')"
        };
        let result = sqlx::query(sql).bind(cutoff).execute(&self.pool).await?;
        let count = result.rows_affected();
        if count > 0 {
            info!(count, older_than_days, "cleaned up old messages");
        }
        Ok(count)
    }

    /// Unconditionally deletes every row for a host, both directions
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn delete_messages_for_host(&self, host_id: HostId) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM message_queue WHERE host_id = ?")
            .bind(host_id.to_string())
            .execute(&self.pool)
            .await?;
        let count = result.rows_affected();
        if count > 0 {
            info!(count, %host_id, "deleted queued messages for host");
        }
        Ok(count)
    }

    /// Deletes the given rows, but only those whose status is FAILED or
    /// EXPIRED. Live rows are never deleted through this path.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn delete_failed_messages(&self, message_ids: &[Uuid]) -> Result<u64, QueueError> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM message_queue \
             WHERE status IN ('failed', 'expired') AND message_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in message_ids {
            query = query.bind(id.to_string());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Loads a single row by id
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn get(&self, message_id: Uuid) -> Result<Option<QueueEntry>, QueueError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM message_queue WHERE message_id = ?");
        let row = sqlx::query(&sql)
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(QueueEntry::from_row).transpose()
    }

    /// Per-status row counts
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM message_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = QueueStats::default();
        for row in &rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.as_str() {
                "pending" => stats.pending = n,
                "in_progress" => stats.in_progress = n,
                "completed" => stats.completed = n,
                "failed" => stats.failed = n,
                "expired" => stats.expired = n,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Deserializes the stored payload of an entry
    ///
    /// # Errors
    ///
    /// Returns an error if the stored text is not valid JSON.
    pub fn deserialize_message_data(entry: &QueueEntry) -> Result<Value, QueueError> {
        Ok(serde_json::from_str(&entry.message_data)?)
    }
}
