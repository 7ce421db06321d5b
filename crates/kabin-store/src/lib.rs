//! Embedded relational store for Kabin.
//!
//! One SQLite database file is shared by the gateway, the kiosk agent, and
//! the staff panel. This crate owns how that file is opened (WAL journaling
//! for multi-process crash safety, a busy timeout so writers queue instead
//! of failing) and how the schema is bootstrapped. It knows nothing about
//! lockers — domain logic lives in `kabin-core`.

mod error;
mod schema;

pub use error::StorageError;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

/// Handle to the shared database. Cheap to clone — clones share one pool.
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (creating if missing) the database file and bootstrap the schema.
    ///
    /// WAL journaling is enabled so the three Kabin processes can read and
    /// write concurrently; a 5 s busy timeout makes contending writers wait
    /// rather than surface `SQLITE_BUSY` to the domain layer.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened and
    /// [`StorageError::Schema`] if bootstrap DDL fails.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|source| StorageError::Open {
                path: path.to_owned(),
                source,
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: path.to_owned(),
                source,
            })?;

        let db = Self { pool };
        db.init_schema().await?;

        info!(path, "database opened");
        Ok(db)
    }

    /// Open a fresh in-memory database. For tests only — data is lost when
    /// the handle is dropped.
    ///
    /// The pool is capped at one connection because every in-memory SQLite
    /// connection is its own database.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection cannot be created.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|source| StorageError::Open {
                path: ":memory:".to_owned(),
                source,
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: ":memory:".to_owned(),
                source,
            })?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// The underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run the bootstrap DDL. Idempotent.
    async fn init_schema(&self) -> Result<(), StorageError> {
        for stmt in schema::SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(StorageError::Schema)?;
        }
        Ok(())
    }

    /// Cheap liveness probe for health endpoints.
    pub async fn healthy(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Timestamp of the most recent event write, for health reporting.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the query fails.
    pub async fn last_write(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let ts = sqlx::query_scalar::<_, Option<DateTime<Utc>>>("SELECT MAX(ts) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(ts)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_bootstraps_schema() {
        let db = Db::open_in_memory().await.unwrap();
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM lockers")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let db = Db::open_in_memory().await.unwrap();
        db.init_schema().await.unwrap();
        assert!(db.healthy().await);
    }

    #[tokio::test]
    async fn last_write_is_none_on_empty_log() {
        let db = Db::open_in_memory().await.unwrap();
        assert_eq!(db.last_write().await.unwrap(), None);
    }
}
