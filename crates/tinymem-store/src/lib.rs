#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-store** – Single-writer SQLite backing for tinyMem.
//!
//! The store owns the database handle and is the only component that opens
//! one. Every other storage component (vault, ledger, memory service, entity
//! map) borrows a pool from here: readers share a small read pool while all
//! writes flow through a one-connection writer pool, which together with
//! SQLite's WAL mode gives snapshot reads alongside a single serialized
//! writer.
//!
//! Migrations are embedded in the binary, applied in lexicographic filename
//! order, each inside its own transaction, and recorded in
//! `schema_migrations`. An already-applied migration is skipped, so opening
//! an existing database is idempotent.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use tinymem_types::{Result, TinyMemError};

/// Embedded migrations, applied in lexicographic filename order.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_artifacts.sql",
        include_str!("../migrations/0001_artifacts.sql"),
    ),
    (
        "0002_ledger.sql",
        include_str!("../migrations/0002_ledger.sql"),
    ),
    (
        "0003_resolution.sql",
        include_str!("../migrations/0003_resolution.sql"),
    ),
    (
        "0004_memory.sql",
        include_str!("../migrations/0004_memory.sql"),
    ),
    (
        "0005_memory_fts.sql",
        include_str!("../migrations/0005_memory_fts.sql"),
    ),
    (
        "0006_metrics.sql",
        include_str!("../migrations/0006_metrics.sql"),
    ),
];

/// Reader pool size. The writer pool is always exactly one connection.
const READER_POOL_SIZE: u32 = 4;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The shared SQLite handle: one serialized writer, pooled readers.
#[derive(Debug, Clone)]
pub struct Store {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema current.
    ///
    /// WAL mode and foreign-key enforcement are requested at connect time
    /// and *verified* afterwards; a database that cannot honor either fails
    /// with [`TinyMemError::StoreUnavailable`]. FTS5 must be compiled into
    /// the linked SQLite (the bundled build carries it); its absence is the
    /// same startup-fatal error.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(|e| TinyMemError::StoreUnavailable(e.to_string()))?;
        let reader = SqlitePoolOptions::new()
            .max_connections(READER_POOL_SIZE)
            .connect_with(options)
            .await
            .map_err(|e| TinyMemError::StoreUnavailable(e.to_string()))?;

        let store = Self { writer, reader };
        store.verify_pragmas(true).await?;
        store.migrate().await?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Open an in-memory database (tests). Reads and writes share the one
    /// connection, and the WAL check is skipped: SQLite memory databases
    /// have no write-ahead log.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| TinyMemError::StoreUnavailable(e.to_string()))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| TinyMemError::StoreUnavailable(e.to_string()))?;
        let store = Self {
            writer: pool.clone(),
            reader: pool,
        };
        store.verify_pragmas(false).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Pool for read-only statements.
    pub fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    /// The single-connection writer pool. Every mutating statement in the
    /// workspace goes through here.
    pub fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    /// Begin a transaction on the writer for atomic multi-statement work.
    pub async fn tx(&self) -> Result<Transaction<'static, Sqlite>> {
        self.writer.begin().await.map_err(TinyMemError::storage)
    }

    /// Close both pools.
    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }

    /// Confirm the pragmas we depend on actually took effect.
    async fn verify_pragmas(&self, expect_wal: bool) -> Result<()> {
        if expect_wal {
            let row = sqlx::query("PRAGMA journal_mode")
                .fetch_one(&self.writer)
                .await
                .map_err(|e| TinyMemError::StoreUnavailable(e.to_string()))?;
            let mode: String = row.get(0);
            if !mode.eq_ignore_ascii_case("wal") {
                return Err(TinyMemError::StoreUnavailable(format!(
                    "WAL mode refused, journal_mode={mode}"
                )));
            }
        }

        let row = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(&self.writer)
            .await
            .map_err(|e| TinyMemError::StoreUnavailable(e.to_string()))?;
        let enabled: i64 = row.get(0);
        if enabled != 1 {
            return Err(TinyMemError::StoreUnavailable(
                "foreign key enforcement refused".to_string(),
            ));
        }

        let row = sqlx::query(
            "SELECT COUNT(*) FROM pragma_compile_options WHERE compile_options = 'ENABLE_FTS5'",
        )
        .fetch_one(&self.writer)
        .await
        .map_err(|e| TinyMemError::StoreUnavailable(e.to_string()))?;
        let fts5: i64 = row.get(0);
        if fts5 != 1 {
            return Err(TinyMemError::StoreUnavailable(
                "linked SQLite lacks FTS5".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply embedded migrations in order, recording each in
    /// `schema_migrations` and skipping any already applied.
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version    TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            ) STRICT",
        )
        .execute(&self.writer)
        .await
        .map_err(|e| TinyMemError::MigrationFailed {
            version: "schema_migrations".to_string(),
            reason: e.to_string(),
        })?;

        for (version, sql) in MIGRATIONS {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?")
                    .bind(version)
                    .fetch_optional(&self.writer)
                    .await
                    .map_err(|e| TinyMemError::MigrationFailed {
                        version: version.to_string(),
                        reason: e.to_string(),
                    })?;
            if applied.is_some() {
                debug!(version, "migration already applied, skipping");
                continue;
            }

            let mut tx =
                self.writer
                    .begin()
                    .await
                    .map_err(|e| TinyMemError::MigrationFailed {
                        version: version.to_string(),
                        reason: e.to_string(),
                    })?;
            sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(|e| {
                TinyMemError::MigrationFailed {
                    version: version.to_string(),
                    reason: e.to_string(),
                }
            })?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(|e| TinyMemError::MigrationFailed {
                    version: version.to_string(),
                    reason: e.to_string(),
                })?;
            tx.commit().await.map_err(|e| TinyMemError::MigrationFailed {
                version: version.to_string(),
                reason: e.to_string(),
            })?;
            info!(version, "migration applied");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_schema_and_records_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.sqlite3")).await.unwrap();

        let row = sqlx::query("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(store.reader())
            .await
            .unwrap();
        let count: i64 = row.get(0);
        assert_eq!(count, MIGRATIONS.len() as i64);
        store.close().await;
    }

    #[tokio::test]
    async fn reopen_skips_applied_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite3");

        {
            let store = Store::open(&path).await.unwrap();
            store.close().await;
        }

        // Second open must not fail or duplicate version rows.
        let store = Store::open(&path).await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(store.reader())
            .await
            .unwrap();
        let count: i64 = row.get(0);
        assert_eq!(count, MIGRATIONS.len() as i64);
        store.close().await;
    }

    #[tokio::test]
    async fn wal_and_foreign_keys_are_active_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.sqlite3")).await.unwrap();

        let row = sqlx::query("PRAGMA journal_mode")
            .fetch_one(store.writer())
            .await
            .unwrap();
        let mode: String = row.get(0);
        assert_eq!(mode.to_lowercase(), "wal");

        let row = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(store.writer())
            .await
            .unwrap();
        let fk: i64 = row.get(0);
        assert_eq!(fk, 1);
        store.close().await;
    }

    #[tokio::test]
    async fn fts5_table_exists() {
        let store = Store::in_memory().await.unwrap();
        // Inserting through the virtual table proves FTS5 is linked in.
        let row = sqlx::query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'memories_fts'",
        )
        .fetch_one(store.reader())
        .await
        .unwrap();
        let count: i64 = row.get(0);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn foreign_keys_reject_orphan_rows() {
        let store = Store::in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO ledger_state_transitions
             (episode_id, entity_key, to_state, artifact_hash, reason, created_at)
             VALUES ('missing', 'x.go::A', 'PROPOSED', 'nohash', 'test', '2026-01-01T00:00:00Z')",
        )
        .execute(store.writer())
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tx_rolls_back_on_drop() {
        let store = Store::in_memory().await.unwrap();
        {
            let mut tx = store.tx().await.unwrap();
            sqlx::query(
                "INSERT INTO artifacts (hash, content, content_type, created_at, byte_size)
                 VALUES ('h', x'00', 'code', '2026-01-01T00:00:00Z', 1)",
            )
            .execute(&mut *tx)
            .await
            .unwrap();
            // Dropped without commit.
        }
        let row = sqlx::query("SELECT COUNT(*) FROM artifacts")
            .fetch_one(store.reader())
            .await
            .unwrap();
        let count: i64 = row.get(0);
        assert_eq!(count, 0);
    }
}
