// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor persistence for source resume positions.
//!
//! Each sync worker owns exactly one key (its partition id) and stores the
//! opaque resume token its source understands: a delta token, an Event Hub
//! offset, a Kubernetes resourceVersion. The sequence generator shares the
//! keyspace under the reserved key `"sequence"`.
//!
//! ## Cursor Semantics
//!
//! A `get` always returns the last token that was **successfully** written.
//! Writes go straight to the backend; there is no write-behind cache, so a
//! crash can never leave a speculative cursor on disk.
//!
//! ```text
//! pull → map → publish OK → set(cursor)
//!                         (crash here = re-read and re-publish, at-least-once)
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Those are retried with capped exponential backoff before
//! surfacing to the worker, which keeps its in-memory cursor and tries
//! again on its next persist.

use crate::error::{ReactivatorError, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Durable key/value store for resume tokens.
///
/// Implementations must tolerate concurrent calls on disjoint keys without
/// any caller-side locking.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last persisted token for `key`, or `None` if never written.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Persist `token` for `key`, replacing any previous value.
    async fn set(&self, key: &str, token: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Release backend resources at shutdown.
    async fn close(&self) {}
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::cursor_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Cursor store backed by a local SQLite database.
pub struct SqliteCursorStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteCursorStore {
    /// Open (creating if needed) the cursor database at `path`.
    ///
    /// `":memory:"` opens a private in-memory database held on a single
    /// pinned connection.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing cursor store");

        let pool = if path_str == ":memory:" {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReactivatorError::Config(format!("Invalid SQLite path: {}", e)))?;
            // Every connection to :memory: is a different database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                .map_err(|e| ReactivatorError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(1))
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                cursor_key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path: path_str })
    }

    /// All persisted cursors (for diagnostics).
    pub async fn list(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT cursor_key, token FROM cursors")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("cursor_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Cursor store closed");
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let pool = &self.pool;
        let row: Option<(String,)> = execute_with_retry("cursor_get", || async {
            sqlx::query_as("SELECT token FROM cursors WHERE cursor_key = ?")
                .bind(key)
                .fetch_optional(pool)
                .await
        })
        .await?;
        Ok(row.map(|(token,)| token))
    }

    async fn set(&self, key: &str, token: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        execute_with_retry("cursor_set", || async {
            sqlx::query(
                r#"
                INSERT INTO cursors (cursor_key, token, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(cursor_key) DO UPDATE SET
                    token = excluded.token,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(token)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        debug!(key, token, "Cursor persisted");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("cursor_delete", || async {
            sqlx::query("DELETE FROM cursors WHERE cursor_key = ?")
                .bind(key)
                .execute(pool)
                .await
        })
        .await?;
        info!(key, "Deleted cursor");
        Ok(())
    }

    async fn close(&self) {
        SqliteCursorStore::close(self).await
    }
}

/// In-process cursor store.
///
/// Not durable. Used by tests and embedders that bring their own
/// persistence; the failure switches let tests simulate an unreachable
/// backend.
#[derive(Default)]
pub struct MemoryCursorStore {
    entries: RwLock<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate entries (e.g. a cursor left by a previous run).
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
            ..Default::default()
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ReactivatorError::CursorUnavailable {
                key: key.to_string(),
                message: "read failure injected".to_string(),
            });
        }
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, token: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ReactivatorError::CursorUnavailable {
                key: key.to_string(),
                message: "write failure injected".to_string(),
            });
        }
        self.entries.write().await.insert(key.to_string(), token.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ReactivatorError::CursorUnavailable {
                key: key.to_string(),
                message: "write failure injected".to_string(),
            });
        }
        self.entries.write().await.remove(key);
        Ok(())
    }
}
