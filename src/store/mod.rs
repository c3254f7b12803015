//! Durable storage: SQLite schema, async-safe handle, tenant gateway.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::errors::GatewayError;

pub mod gateway;
pub mod jobs;
pub mod models;

pub use gateway::{SystemScope, TenantScope};
pub use models::*;

/// Async-safe handle to the studio database.
///
/// Wraps `StudioDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StudioDb>>,
}

impl DbHandle {
    pub fn new(db: StudioDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StudioDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| GatewayError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StudioDb>> {
        self.inner
            .lock()
            .map_err(|_| GatewayError::LockPoisoned.into())
    }
}

pub struct StudioDb {
    conn: Connection,
}

impl StudioDb {
    /// Open (or create) a SQLite database at the given path and run
    /// migrations plus the per-connection session schema.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        self.init_session_schema()
            .context("Failed to create session schema")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tenants (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    api_token TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS ideas (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS documents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    idea_id INTEGER NOT NULL REFERENCES ideas(id) ON DELETE CASCADE,
                    tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'draft',
                    content TEXT NOT NULL DEFAULT '',
                    external_id TEXT,
                    generation_started_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                    idea_id INTEGER NOT NULL REFERENCES ideas(id),
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    progress TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_ideas_tenant ON ideas(tenant_id);
                CREATE INDEX IF NOT EXISTS idx_documents_idea ON documents(idea_id, kind);
                CREATE INDEX IF NOT EXISTS idx_documents_external ON documents(external_id)
                    WHERE external_id IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_jobs_idea ON jobs(idea_id, kind);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Per-connection session context and tenant-filtered views.
    ///
    /// SQLite has no row-level security policies, so the session-variable
    /// design is reproduced with a temp table holding the authenticated role
    /// and tenant subject, plus temp views that join on it. A scoped read
    /// that forgets a tenant predicate still cannot see foreign rows: the
    /// views return nothing unless the session context names the tenant.
    fn init_session_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TEMP TABLE IF NOT EXISTS session_ctx (
                    role TEXT NOT NULL,
                    tenant_id INTEGER
                );

                CREATE TEMP VIEW IF NOT EXISTS tenant_ideas AS
                    SELECT i.* FROM ideas i
                    JOIN session_ctx s ON s.tenant_id = i.tenant_id AND s.role = 'tenant';

                CREATE TEMP VIEW IF NOT EXISTS tenant_documents AS
                    SELECT d.* FROM documents d
                    JOIN session_ctx s ON s.tenant_id = d.tenant_id AND s.role = 'tenant';

                -- Views have no implicit rowid; jobs use TEXT ids, so the
                -- insertion order needed for recency tie-breaks is exposed
                -- explicitly as rn.
                CREATE TEMP VIEW IF NOT EXISTS tenant_jobs AS
                    SELECT j.rowid AS rn, j.* FROM jobs j
                    JOIN session_ctx s ON s.tenant_id = j.tenant_id AND s.role = 'tenant';
                ",
            )
            .context("Failed to create session context schema")?;
        Ok(())
    }

    // ── Privileged bookkeeping (non-tenant-owned reads) ───────────────
    //
    // These run outside any tenant scope: request authentication has to
    // resolve a token to a tenant before a scope can exist.

    pub fn create_tenant(&self, name: &str, api_token: &str) -> Result<Tenant> {
        self.conn
            .execute(
                "INSERT INTO tenants (name, api_token) VALUES (?1, ?2)",
                params![name, api_token],
            )
            .context("Failed to insert tenant")?;
        let id = self.conn.last_insert_rowid();
        self.tenant(id)?.context("Tenant not found after insert")
    }

    pub fn tenant(&self, id: i64) -> Result<Option<Tenant>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, api_token, created_at FROM tenants WHERE id = ?1")
            .context("Failed to prepare tenant lookup")?;
        let mut rows = stmt
            .query_map(params![id], tenant_from_row)
            .context("Failed to query tenant")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read tenant row")?)),
            None => Ok(None),
        }
    }

    pub fn tenant_by_token(&self, api_token: &str) -> Result<Option<Tenant>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, api_token, created_at FROM tenants WHERE api_token = ?1")
            .context("Failed to prepare tenant token lookup")?;
        let mut rows = stmt
            .query_map(params![api_token], tenant_from_row)
            .context("Failed to query tenant by token")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read tenant row")?)),
            None => Ok(None),
        }
    }
}

fn tenant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        api_token: row.get(2)?,
        created_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = StudioDb::new_in_memory().unwrap();
        db.run_migrations().unwrap();
        db.init_session_schema().unwrap();
    }

    #[test]
    fn test_create_and_lookup_tenant() {
        let db = StudioDb::new_in_memory().unwrap();
        let tenant = db.create_tenant("acme", "tok-1").unwrap();
        assert_eq!(tenant.name, "acme");

        let found = db.tenant_by_token("tok-1").unwrap().unwrap();
        assert_eq!(found.id, tenant.id);
        assert!(db.tenant_by_token("tok-missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_api_token_rejected() {
        let db = StudioDb::new_in_memory().unwrap();
        db.create_tenant("a", "tok").unwrap();
        assert!(db.create_tenant("b", "tok").is_err());
    }

    #[test]
    fn test_file_backed_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("studio.db");
        {
            let db = StudioDb::new(&path).unwrap();
            db.create_tenant("acme", "tok-1").unwrap();
        }
        let db = StudioDb::new(&path).unwrap();
        assert!(db.tenant_by_token("tok-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_db_handle_call() {
        let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
        let tenant = db
            .call(|db| db.create_tenant("acme", "tok-1"))
            .await
            .unwrap();
        assert_eq!(tenant.name, "acme");
    }

    #[test]
    fn test_poisoned_handle_reports_gateway_error() {
        let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
        let poisoner = db.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock_sync().unwrap();
            panic!("holder dies with the lock");
        })
        .join();

        let err = db.lock_sync().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::LockPoisoned)
        ));
    }
}
