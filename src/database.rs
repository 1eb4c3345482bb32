//! Embedded SQLite storage
//!
//! Owns the connection pool and the embedded migration set. Every persistent
//! component (hosts, message queue) borrows the pool from here; schema
//! creation happens exclusively through migrations, never ad-hoc
//! `CREATE TABLE IF NOT EXISTS`.

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Static migrator for embedded `SQLite` migrations
static MIGRATOR: Migrator = sqlx::migrate!();

/// Database-specific error types
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Error from `SQLx`
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Migration failure
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// File system I/O error
    #[error("file system error at {path}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Database result type
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database connection with managed pool
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
}

impl DatabaseConnection {
    /// Opens (creating if missing) the database at `path`, applies pragmas,
    /// and runs embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, the pool
    /// cannot connect, or a migration fails.
    pub async fn initialize(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DatabaseError::FileSystem {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("synchronous", "NORMAL")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;
        info!(path = %path.display(), "database initialized");

        Ok(Self { pool })
    }

    /// Opens a private in-memory database with migrations applied. Intended
    /// for tests; the single-connection pool keeps the memory database alive
    /// and shared across all queries.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a migration fails.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Borrow the underlying pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn initialize_creates_schema_via_migrations() {
        let dir = TempDir::new().expect("temp dir");
        let db = DatabaseConnection::initialize(&dir.path().join("test.db"))
            .await
            .expect("initialize");

        for table in ["hosts", "message_queue"] {
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_optional(db.pool())
            .await
            .expect("query sqlite_master");
            assert!(row.is_some(), "{table} table should exist after migrations");
        }
    }

    #[tokio::test]
    async fn in_memory_database_is_migrated() {
        let db = DatabaseConnection::open_in_memory().await.expect("open");
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM message_queue")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count, 0);
    }
}
