//! Host records consumed by the core
//!
//! The wider admin surface owns the business columns of a host; the core
//! reads identity and approval state, and writes only liveness (`status`,
//! `active`, `last_access`) plus registration attributes reported by the
//! agent itself.

use crate::domain_types::HostId;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::instrument;

const SELECT_COLUMNS: &str = "id, fqdn, ipv4, ipv6, platform, approval_status, \
     is_agent_privileged, active, status, last_access";

/// Errors from host persistence
#[derive(Debug, Error)]
pub enum HostStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt host row: {message}")]
    Corrupt { message: String },
}

/// Approval state of a registered host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    fn parse(value: &str) -> Result<Self, HostStoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            unknown => Err(HostStoreError::Corrupt {
                message: format!("unknown approval_status '{unknown}'"),
            }),
        }
    }
}

/// A persisted host as seen by the core
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub id: HostId,
    pub fqdn: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub platform: Option<String>,
    pub approval_status: ApprovalStatus,
    pub is_agent_privileged: bool,
    pub active: bool,
    /// Liveness: `up` while a session is registered, `down` otherwise
    pub status: String,
    /// Unix milliseconds of the last heartbeat or registration
    pub last_access: Option<i64>,
}

impl HostRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, HostStoreError> {
        let id_text: String = row.get("id");
        let id = HostId::parse(&id_text).map_err(|e| HostStoreError::Corrupt {
            message: format!("invalid host id '{id_text}': {e}"),
        })?;
        let approval_text: String = row.get("approval_status");
        Ok(Self {
            id,
            fqdn: row.get("fqdn"),
            ipv4: row.get("ipv4"),
            ipv6: row.get("ipv6"),
            platform: row.get("platform"),
            approval_status: ApprovalStatus::parse(&approval_text)?,
            is_agent_privileged: row.get::<i64, _>("is_agent_privileged") != 0,
            active: row.get::<i64, _>("active") != 0,
            status: row.get("status"),
            last_access: row.get("last_access"),
        })
    }
}

/// Storage access for host records
#[derive(Clone)]
pub struct HostStore {
    pool: SqlitePool,
}

impl HostStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Looks up a host by id
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn find_by_id(&self, host_id: HostId) -> Result<Option<HostRecord>, HostStoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM hosts WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(host_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(HostRecord::from_row).transpose()
    }

    /// Looks up a host by fqdn, case-insensitively
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub async fn find_by_fqdn(&self, fqdn: &str) -> Result<Option<HostRecord>, HostStoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM hosts WHERE lower(fqdn) = lower(?)");
        let row = sqlx::query(&sql)
            .bind(fqdn)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(HostRecord::from_row).transpose()
    }

    /// Creates or updates a host from an agent registration. A new host
    /// starts in `pending` approval; an existing host keeps whatever
    /// approval state the admin surface set. Either way the host comes up.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[instrument(skip(self), fields(fqdn = %fqdn))]
    pub async fn register(
        &self,
        fqdn: &str,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
        platform: Option<&str>,
    ) -> Result<HostRecord, HostStoreError> {
        let now = Utc::now().timestamp_millis();
        if let Some(existing) = self.find_by_fqdn(fqdn).await? {
            sqlx::query(
                "UPDATE hosts SET ipv4 = COALESCE(?, ipv4), ipv6 = COALESCE(?, ipv6), \
                 platform = COALESCE(?, platform), status = 'up', active = 1, last_access = ? \
                 WHERE id = ?",
            )
            .bind(ipv4)
            .bind(ipv6)
            .bind(platform)
            .bind(now)
            .bind(existing.id.to_string())
            .execute(&self.pool)
            .await?;
            return self
                .find_by_id(existing.id)
                .await?
                .ok_or_else(|| HostStoreError::Corrupt {
                    message: format!("host {} vanished during registration", existing.id),
                });
        }

        let host_id = HostId::generate();
        sqlx::query(
            "INSERT INTO hosts (id, fqdn, ipv4, ipv6, platform, approval_status, \
             is_agent_privileged, active, status, last_access, created_at) \
             VALUES (?, ?, ?, ?, ?, 'pending', 0, 1, 'up', ?, ?)",
        )
        .bind(host_id.to_string())
        .bind(fqdn)
        .bind(ipv4)
        .bind(ipv6)
        .bind(platform)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_by_id(host_id)
            .await?
            .ok_or_else(|| HostStoreError::Corrupt {
                message: format!("host {host_id} vanished during registration"),
            })
    }

    /// Records a heartbeat: the host is up, active, and was seen now
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn record_heartbeat(&self, host_id: HostId) -> Result<(), HostStoreError> {
        sqlx::query("UPDATE hosts SET status = 'up', active = 1, last_access = ? WHERE id = ?")
            .bind(Utc::now().timestamp_millis())
            .bind(host_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks a host down after its session ends
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn mark_down(&self, host_id: HostId) -> Result<(), HostStoreError> {
        sqlx::query("UPDATE hosts SET status = 'down' WHERE id = ?")
            .bind(host_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sets the approval state. Narrow contract used by the admin surface
    /// (and tests); the core itself never calls this from message handlers.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_approval(
        &self,
        host_id: HostId,
        approval: ApprovalStatus,
    ) -> Result<(), HostStoreError> {
        sqlx::query("UPDATE hosts SET approval_status = ? WHERE id = ?")
            .bind(approval.as_str())
            .bind(host_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
