//! Shared SQLite connection for the credential rows and the audit ledger.
//!
//! Every statement runs inside `spawn_blocking` behind an async mutex, so
//! callers never block the runtime on disk I/O.

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{PipelineError, Result};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS auth_users (
        provider      TEXT NOT NULL,
        user_id       TEXT NOT NULL,
        access_token  TEXT NOT NULL,
        refresh_token TEXT,
        expiry_date   INTEGER,
        updated_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        PRIMARY KEY (provider, user_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processed_objects (
        id               TEXT PRIMARY KEY,
        thread_id        TEXT NOT NULL,
        message_id       TEXT NOT NULL,
        object_type      TEXT NOT NULL,
        result           TEXT NOT NULL,
        object_timestamp TEXT NOT NULL,
        created_at       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_processed_objects_key
        ON processed_objects (thread_id, message_id, object_type);
    CREATE INDEX IF NOT EXISTS idx_processed_objects_created
        ON processed_objects (created_at);
    "#,
];

/// Cloneable handle to a single SQLite connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) a database file and run migrations
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            Ok(conn)
        })
        .await
        .map_err(join_error)??;

        Self::migrated(conn).await
    }

    /// Open a private in-memory database
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            Ok(Connection::open_in_memory()?)
        })
        .await
        .map_err(join_error)??;

        Self::migrated(conn).await
    }

    async fn migrated(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_conn(|conn| {
            for migration in MIGRATIONS {
                conn.execute_batch(migration)?;
            }
            Ok(())
        })
        .await?;
        Ok(db)
    }

    /// Run `f` against the connection on the blocking pool
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(join_error)?
    }
}

fn join_error(err: tokio::task::JoinError) -> PipelineError {
    PipelineError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let db = Database::open_in_memory().await.unwrap();
        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .unwrap();
        assert_eq!(tables, vec!["auth_users", "processed_objects"]);
    }

    #[tokio::test]
    async fn test_open_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pipeline.db");
        Database::open(&path).await.unwrap();
        assert!(path.exists());
    }
}
