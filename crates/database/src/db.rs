//! Opening the index database.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// The persist pipeline is the only writer; the rest are scan workers
/// reading folder headers.
const MAX_CONNECTIONS: u32 = 5;
/// Reconciling a large folder holds the write lock for the whole unit of
/// work, so readers need to be willing to wait for it.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection settings that `SqliteConnectOptions` has no setter for.
const CONNECTION_PRAGMAS: &[(&str, &str)] = &[
    ("wal_autocheckpoint", "1000"),
    // KiB when negative.
    ("cache_size", "-16384"),
    ("temp_store", "MEMORY"),
    ("analysis_limit", "400"),
];

/// Connection pool for the node index.
///
/// The index is derived state: the filesystem is the source of truth, and a
/// deleted database file is rebuilt by the next full scan.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the index at `path` and bring its schema up to date.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::options().filename(path.as_ref()).create_if_missing(true);
        Self::open(options, MAX_CONNECTIONS).await
    }

    /// A private in-memory index. Not test-only: other crates use it in their tests.
    ///
    /// Every connection to `:memory:` is a separate database, so the pool is
    /// limited to one connection. Callers must not hold a [`UnitOfWork`] while
    /// reading through another handle.
    ///
    /// [`UnitOfWork`]: crate::UnitOfWork
    pub async fn connect_in_memory() -> Result<Self> {
        Self::open(Self::options().filename(":memory:"), 1).await
    }

    fn options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            // Deleting a root cascades to its nodes.
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .auto_vacuum(SqliteAutoVacuum::Incremental)
    }

    async fn open(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // Runs for every connection the pool opens, not just the first.
            .after_connect(|conn, _meta| Box::pin(async move { Self::apply_pragmas(conn).await }))
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn apply_pragmas(conn: &mut SqliteConnection) -> sqlx::Result<()> {
        for (name, value) in CONNECTION_PRAGMAS {
            sqlx::query(&format!("PRAGMA {name} = {value}")).execute(&mut *conn).await?;
        }
        Ok(())
    }

    #[instrument("migrating node index", skip(self))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Release free pages, refresh planner statistics, then wait for every
    /// connection to come back and close them.
    pub async fn close(&self) {
        _ = sqlx::query("PRAGMA incremental_vacuum").execute(&self.pool).await;
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_schema_is_current() {
        let db = Database::connect_in_memory().await.unwrap();
        assert!(!db.pool().is_closed());
        // Already applied; running again is a no-op.
        db.migrate().await.unwrap();
        db.close().await;
        assert!(db.pool().is_closed());
    }

    #[tokio::test]
    async fn test_connect_creates_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("folio.db");
        let db = Database::connect(&path).await.unwrap();
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite%' AND name NOT LIKE '%sqlx%'
             ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(tables, vec!["nodes", "root_directories", "roots"]);
        db.close().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_every_connection_is_configured() {
        let db = Database::connect_in_memory().await.unwrap();
        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys").fetch_one(db.pool()).await.unwrap();
        assert_eq!(foreign_keys, 1);
        let cache_size: i64 = sqlx::query_scalar("PRAGMA cache_size").fetch_one(db.pool()).await.unwrap();
        assert_eq!(cache_size, -16384);
        db.close().await;
    }
}
