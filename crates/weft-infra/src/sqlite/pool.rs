//! SQLite connection management for the engine database.
//!
//! One database file carries both the persistence tables and the queue, so
//! the pools are shaped by the engine's access pattern: every step turn is
//! a burst of small writes (status transition, action results, successor
//! publishes) while consumers poll with point reads in between. SQLite
//! serializes writers, so the writer pool holds exactly one connection and
//! the reader pool scales with the number of consumers. WAL journaling with
//! `synchronous=NORMAL` keeps the per-turn write burst off the fsync path
//! while the log still survives a crash.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// How long a connection waits on the writer lock before giving up. Step
/// turns hold the writer for single statements only, so anything past this
/// indicates a wedged process rather than contention.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on reader connections regardless of consumer count.
const MAX_READ_CONNECTIONS: usize = 32;

/// Split read/write pools over the engine database.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open the engine database, creating the file and running migrations
    /// if needed.
    ///
    /// `read_connections` should cover the step consumers plus whatever
    /// inspection surface runs alongside them; callers typically pass
    /// `EngineConfig::step_consumers + 2`. The value is clamped to
    /// `[1, 32]`.
    pub async fn open(
        database_url: &str,
        read_connections: usize,
    ) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;

        // Schema must exist before the read-only pool opens: a read-only
        // connection cannot create the database file.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(read_connections.clamp(1, MAX_READ_CONNECTIONS) as u32)
            .connect_with(options.read_only(true))
            .await?;

        Ok(Self { reader, writer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(dir: &tempfile::TempDir, name: &str) -> String {
        format!("sqlite://{}?mode=rwc", dir.path().join(name).display())
    }

    #[tokio::test]
    async fn open_is_idempotent_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let url = url(&dir, "engine.db");

        // First open creates the schema; the second must tolerate it.
        let first = DatabasePool::open(&url, 4).await.unwrap();
        drop(first);
        let second = DatabasePool::open(&url, 4).await.unwrap();

        let migrations: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM _sqlx_migrations")
                .fetch_one(&second.reader)
                .await
                .unwrap();
        assert!(migrations.0 >= 2, "both migrations applied once");
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = url(&dir, "durable.db");

        {
            let pool = DatabasePool::open(&url, 2).await.unwrap();
            sqlx::query(
                "INSERT INTO queue_messages
                 (id, queue, payload, available_at, delivery_count, locked_until, created_at)
                 VALUES ('m1', 'work', '{}', '2026-01-01T00:00:00.000000Z', 0, NULL,
                         '2026-01-01T00:00:00.000000Z')",
            )
            .execute(&pool.writer)
            .await
            .unwrap();
        }

        let pool = DatabasePool::open(&url, 2).await.unwrap();
        let depth: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue = 'work'")
                .fetch_one(&pool.reader)
                .await
                .unwrap();
        assert_eq!(depth.0, 1, "queued message survived the restart");
    }

    #[tokio::test]
    async fn reader_pool_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&url(&dir, "ro.db"), 2).await.unwrap();

        let result = sqlx::query(
            "INSERT INTO workflows (id, name, status, definition, created_at, updated_at)
             VALUES ('w1', 'wf', 'draft', '{}', '', '')",
        )
        .execute(&pool.reader)
        .await;
        assert!(result.is_err(), "reader connections are read-only");
    }

    #[tokio::test]
    async fn journal_and_sync_pragmas_applied() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&url(&dir, "pragmas.db"), 2).await.unwrap();

        let journal: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(journal.0.to_lowercase(), "wal");

        // NORMAL == 1
        let synchronous: (i64,) = sqlx::query_as("PRAGMA synchronous")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(synchronous.0, 1);

        let foreign_keys: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(foreign_keys.0, 1);
    }
}
