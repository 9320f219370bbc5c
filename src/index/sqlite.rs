//! SQLite-backed namespace index.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`; that
//! mutex plus SQLite transactions make the index the single-writer
//! sequencer for concurrent puts to the same key.
//!
//! WAL journaling means every mutation is committed before the call
//! returns and the index survives process crash and restart. With
//! `synchronous = NORMAL` the most recent commits can still be lost on
//! OS crash or power failure; blob files are content-addressed, so a
//! lost commit drops the name, never corrupts data.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::store::{DeleteOutcome, NamespaceEntry, NamespaceIndex, PutOutcome, RepositorySummary};
use crate::blobstore::BlobRef;

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Namespace index backed by a single SQLite database file.
pub struct SqliteNamespaceIndex {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteNamespaceIndex {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.apply_pragmas()?;
        index.init_db()?;
        Ok(index)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            -- NORMAL under WAL survives process crash; an OS crash or
            -- power failure can drop the most recent commits.
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// Idempotent -- safe to call on every startup (crash-only design).
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            -- Known blobs with namespace reference counts
            CREATE TABLE IF NOT EXISTS blobs (
                hash       TEXT PRIMARY KEY,
                size       INTEGER NOT NULL,
                ref_count  INTEGER NOT NULL DEFAULT 0
            );

            -- Namespace entries
            CREATE TABLE IF NOT EXISTS entries (
                repository  TEXT NOT NULL,
                path        TEXT NOT NULL,
                hash        TEXT NOT NULL,
                updated_at  TEXT NOT NULL,

                PRIMARY KEY (repository, path),
                FOREIGN KEY (hash) REFERENCES blobs(hash)
            );

            CREATE INDEX IF NOT EXISTS idx_entries_repository
                ON entries(repository);
            ",
        )?;

        // Record schema version if not already present.
        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.is_none() || existing.unwrap() < SCHEMA_VERSION {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now_rfc3339()],
            )?;
        }

        Ok(())
    }
}

/// Get current time as an RFC 3339 string with millisecond precision.
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Read the entry at (repository, path) inside an open connection or
/// transaction.
fn query_entry(
    conn: &Connection,
    repository: &str,
    path: &str,
) -> rusqlite::Result<Option<NamespaceEntry>> {
    conn.query_row(
        "SELECT e.repository, e.path, e.hash, b.size, e.updated_at
         FROM entries e JOIN blobs b ON e.hash = b.hash
         WHERE e.repository = ?1 AND e.path = ?2",
        params![repository, path],
        |row| {
            Ok(NamespaceEntry {
                repository: row.get(0)?,
                path: row.get(1)?,
                blob: BlobRef {
                    hash: row.get(2)?,
                    size: row.get::<_, i64>(3)? as u64,
                },
                updated_at: row.get(4)?,
            })
        },
    )
    .optional()
}

/// Decrement a blob's reference count; if it reaches zero, drop the row
/// and report the blob so the caller can remove its file.
fn release_blob(conn: &Connection, blob: &BlobRef) -> rusqlite::Result<Option<BlobRef>> {
    conn.execute(
        "UPDATE blobs SET ref_count = ref_count - 1 WHERE hash = ?1",
        params![blob.hash],
    )?;
    let remaining: Option<i64> = conn
        .query_row(
            "SELECT ref_count FROM blobs WHERE hash = ?1",
            params![blob.hash],
            |row| row.get(0),
        )
        .optional()?;
    if remaining.is_some_and(|n| n <= 0) {
        conn.execute("DELETE FROM blobs WHERE hash = ?1", params![blob.hash])?;
        return Ok(Some(blob.clone()));
    }
    Ok(None)
}

// ── NamespaceIndex implementation ──────────────────────────────────

impl NamespaceIndex for SqliteNamespaceIndex {
    fn put(
        &self,
        repository: &str,
        path: &str,
        blob: BlobRef,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutOutcome>> + Send + '_>> {
        let repository = repository.to_string();
        let path = path.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;

            let previous = query_entry(&tx, &repository, &path)?;

            // Register the blob (no-op when already known), then take the
            // new entry's reference before releasing the old one so the
            // count never transiently reads zero for a live blob.
            tx.execute(
                "INSERT INTO blobs (hash, size, ref_count) VALUES (?1, ?2, 0)
                 ON CONFLICT(hash) DO NOTHING",
                params![blob.hash, blob.size as i64],
            )?;
            tx.execute(
                "INSERT INTO entries (repository, path, hash, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(repository, path) DO UPDATE
                 SET hash = excluded.hash, updated_at = excluded.updated_at",
                params![repository, path, blob.hash, now_rfc3339()],
            )?;
            tx.execute(
                "UPDATE blobs SET ref_count = ref_count + 1 WHERE hash = ?1",
                params![blob.hash],
            )?;

            let mut unreferenced = Vec::new();
            if let Some(prev) = &previous {
                if let Some(orphan) = release_blob(&tx, &prev.blob)? {
                    unreferenced.push(orphan);
                }
            }

            tx.commit()?;
            Ok(PutOutcome {
                previous,
                unreferenced,
            })
        })
    }

    fn get(
        &self,
        repository: &str,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<NamespaceEntry>>> + Send + '_>> {
        let repository = repository.to_string();
        let path = path.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            Ok(query_entry(&conn, &repository, &path)?)
        })
    }

    fn list(
        &self,
        repository: &str,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<NamespaceEntry>>> + Send + '_>> {
        let repository = repository.to_string();
        let prefix = prefix.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // substr comparison instead of LIKE so wildcard characters in
            // the prefix are matched literally.
            let mut stmt = conn.prepare(
                "SELECT e.repository, e.path, e.hash, b.size, e.updated_at
                 FROM entries e JOIN blobs b ON e.hash = b.hash
                 WHERE e.repository = ?1 AND substr(e.path, 1, length(?2)) = ?2
                 ORDER BY e.path",
            )?;
            let rows = stmt.query_map(params![repository, prefix], |row| {
                Ok(NamespaceEntry {
                    repository: row.get(0)?,
                    path: row.get(1)?,
                    blob: BlobRef {
                        hash: row.get(2)?,
                        size: row.get::<_, i64>(3)? as u64,
                    },
                    updated_at: row.get(4)?,
                })
            })?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    fn delete(
        &self,
        repository: &str,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<DeleteOutcome>>> + Send + '_>> {
        let repository = repository.to_string();
        let path = path.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;

            let removed = match query_entry(&tx, &repository, &path)? {
                Some(entry) => entry,
                None => return Ok(None),
            };

            tx.execute(
                "DELETE FROM entries WHERE repository = ?1 AND path = ?2",
                params![repository, path],
            )?;
            let mut unreferenced = Vec::new();
            if let Some(orphan) = release_blob(&tx, &removed.blob)? {
                unreferenced.push(orphan);
            }

            tx.commit()?;
            Ok(Some(DeleteOutcome {
                removed,
                unreferenced,
            }))
        })
    }

    fn ref_count(
        &self,
        hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let hash = hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let count: Option<i64> = conn
                .query_row(
                    "SELECT ref_count FROM blobs WHERE hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0).max(0) as u64)
        })
    }

    fn list_repositories(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<RepositorySummary>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT repository, COUNT(*) FROM entries
                 GROUP BY repository ORDER BY repository",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RepositorySummary {
                    name: row.get(0)?,
                    entries: row.get::<_, i64>(1)? as u64,
                })
            })?;
            let mut repositories = Vec::new();
            for row in rows {
                repositories.push(row?);
            }
            Ok(repositories)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
