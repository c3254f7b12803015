//! Tenant-scoped data gateway.
//!
//! Every storage operation that touches tenant-owned tables runs inside
//! `with_tenant_scope`: a transaction that first writes the caller's
//! authenticated role and tenant subject into the per-connection
//! `session_ctx` table, then hands out a [`TenantScope`] capability. All
//! scoped reads go through temp views that join on `session_ctx`, so the
//! engine itself filters rows — a handler that forgets a tenant predicate
//! cannot leak cross-tenant data.
//!
//! [`SystemScope`] is the privileged counterpart for the two trusted
//! internal callers that act before a request-scoped tenant is known:
//! webhook ingestion and the timeout sweeper. Both are authenticated by a
//! shared secret or run on an internal timer, never on behalf of an end
//! user.

use anyhow::{Context, Result};
use rusqlite::{Transaction, params};

use crate::errors::GatewayError;

use super::models::*;
use super::StudioDb;

/// Capability for tenant-scoped storage access. Constructible only by
/// [`StudioDb::with_tenant_scope`]; holding one proves the session context
/// has been established for exactly one tenant.
pub struct TenantScope<'a> {
    tx: &'a Transaction<'a>,
    tenant_id: i64,
}

/// Capability for privileged storage access (webhook ingestion, sweeper).
pub struct SystemScope<'a> {
    tx: &'a Transaction<'a>,
}

impl StudioDb {
    /// Open a transaction, set the session context (role marker + tenant
    /// subject), run `f` against it, and commit or roll back atomically.
    ///
    /// Every scoped call pays one extra statement to set the session
    /// variables; batch operations should share one scope rather than
    /// opening one per row. If session-context assignment fails, the whole
    /// transaction aborts and the caller receives a generic
    /// [`GatewayError::SessionContext`] — never partial access.
    pub fn with_tenant_scope<T>(
        &self,
        tenant_id: i64,
        f: impl FnOnce(&TenantScope<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = self
            .conn()
            .unchecked_transaction()
            .map_err(GatewayError::Transaction)?;
        set_session_ctx(&tx, "tenant", Some(tenant_id))
            .map_err(|_| GatewayError::SessionContext)?;

        let scope = TenantScope { tx: &tx, tenant_id };
        match f(&scope) {
            Ok(value) => {
                tx.commit().map_err(GatewayError::Transaction)?;
                // Best-effort: the work is already committed, so a cleanup
                // failure is logged rather than reported as an error. The
                // next scope clears the context before setting its own.
                if let Err(e) = self.conn().execute("DELETE FROM session_ctx", []) {
                    tracing::warn!(error = %e, "Failed to clear session context after commit");
                }
                Ok(value)
            }
            Err(e) => Err(e), // dropping the transaction rolls back, ctx included
        }
    }

    /// Privileged scope for trusted internal callers. No session context is
    /// set; the tenant views stay empty and operations address base tables
    /// directly.
    pub fn with_system_scope<T>(
        &self,
        f: impl FnOnce(&SystemScope<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = self
            .conn()
            .unchecked_transaction()
            .map_err(GatewayError::Transaction)?;
        let scope = SystemScope { tx: &tx };
        match f(&scope) {
            Ok(value) => {
                tx.commit().map_err(GatewayError::Transaction)?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}

fn set_session_ctx(tx: &Transaction<'_>, role: &str, tenant_id: Option<i64>) -> Result<()> {
    tx.execute("DELETE FROM session_ctx", [])
        .context("Failed to clear session context")?;
    tx.execute(
        "INSERT INTO session_ctx (role, tenant_id) VALUES (?1, ?2)",
        params![role, tenant_id],
    )
    .context("Failed to set session context")?;
    Ok(())
}

// ── Tenant-scoped operations ─────────────────────────────────────────

impl<'a> TenantScope<'a> {
    pub(crate) fn tx(&self) -> &Transaction<'a> {
        self.tx
    }

    pub fn tenant_id(&self) -> i64 {
        self.tenant_id
    }

    pub fn create_idea(&self, title: &str, description: &str) -> Result<Idea> {
        self.tx
            .execute(
                "INSERT INTO ideas (tenant_id, title, description) VALUES (?1, ?2, ?3)",
                params![self.tenant_id, title, description],
            )
            .context("Failed to insert idea")?;
        let id = self.tx.last_insert_rowid();
        self.idea(id)?.context("Idea not found after insert")
    }

    pub fn idea(&self, id: i64) -> Result<Option<Idea>> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT id, tenant_id, title, description, created_at
                 FROM tenant_ideas WHERE id = ?1",
            )
            .context("Failed to prepare idea lookup")?;
        let mut rows = stmt
            .query_map(params![id], idea_from_row)
            .context("Failed to query idea")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read idea row")?)),
            None => Ok(None),
        }
    }

    pub fn documents(&self, idea_id: i64) -> Result<Vec<Document>> {
        let mut stmt = self
            .tx
            .prepare(&format!(
                "SELECT {DOCUMENT_COLS} FROM tenant_documents WHERE idea_id = ?1 ORDER BY id"
            ))
            .context("Failed to prepare document list")?;
        let rows = stmt
            .query_map(params![idea_id], document_row)
            .context("Failed to query documents")?;
        collect_documents(rows)
    }

    /// The most recent document of the given kind for this idea.
    pub fn latest_document(&self, idea_id: i64, kind: DocumentKind) -> Result<Option<Document>> {
        let mut stmt = self
            .tx
            .prepare(&format!(
                "SELECT {DOCUMENT_COLS} FROM tenant_documents
                 WHERE idea_id = ?1 AND kind = ?2 ORDER BY id DESC LIMIT 1"
            ))
            .context("Failed to prepare latest document lookup")?;
        let mut rows = stmt
            .query_map(params![idea_id, kind.as_str()], document_row)
            .context("Failed to query latest document")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read document row")?.try_into()?)),
            None => Ok(None),
        }
    }

    /// Mark the document of this kind as `generating` (creating it first if
    /// the idea has none yet) and stamp `generation_started_at`.
    pub fn begin_generation(&self, idea_id: i64, kind: DocumentKind) -> Result<Document> {
        let doc_id = match self.latest_document(idea_id, kind)? {
            Some(doc) => {
                self.tx
                    .execute(
                        "UPDATE documents
                         SET status = 'generating',
                             generation_started_at = datetime('now'),
                             updated_at = datetime('now')
                         WHERE id = ?1 AND tenant_id = ?2",
                        params![doc.id, self.tenant_id],
                    )
                    .context("Failed to mark document generating")?;
                doc.id
            }
            None => {
                self.tx
                    .execute(
                        "INSERT INTO documents
                             (idea_id, tenant_id, kind, status, generation_started_at)
                         VALUES (?1, ?2, ?3, 'generating', datetime('now'))",
                        params![idea_id, self.tenant_id, kind.as_str()],
                    )
                    .context("Failed to insert document")?;
                self.tx.last_insert_rowid()
            }
        };
        self.latest_document(idea_id, kind)?
            .filter(|d| d.id == doc_id)
            .context("Document not found after begin_generation")
    }

    /// Store the external correlation id for the current generation attempt.
    /// A re-generation reuses the document row, so the fresh id replaces any
    /// id left over from an earlier attempt; only reconciliation is limited
    /// to filling a missing id (see [`SystemScope::finalize_document`]).
    pub fn record_external_id(&self, document_id: i64, external_id: &str) -> Result<()> {
        self.tx
            .execute(
                "UPDATE documents
                 SET external_id = ?1,
                     updated_at = datetime('now')
                 WHERE id = ?2 AND tenant_id = ?3",
                params![external_id, document_id, self.tenant_id],
            )
            .context("Failed to record external id")?;
        Ok(())
    }

    /// Mark a document `failed` unless reconciliation already reached a
    /// terminal state for it. Sibling documents are untouched, so a
    /// user-initiated retry remains possible.
    pub fn fail_document(&self, document_id: i64) -> Result<bool> {
        let changed = self
            .tx
            .execute(
                "UPDATE documents
                 SET status = 'failed', updated_at = datetime('now')
                 WHERE id = ?1 AND tenant_id = ?2
                   AND status NOT IN ('completed', 'failed')",
                params![document_id, self.tenant_id],
            )
            .context("Failed to fail document")?;
        Ok(changed > 0)
    }

    /// Cross-document correlation ids the external generator needs: for each
    /// document kind, the latest document's external id (None when the
    /// upstream document is missing or not yet correlated).
    pub fn upstream_context(&self, idea_id: i64) -> Result<Vec<(DocumentKind, Option<String>)>> {
        let mut context = Vec::with_capacity(DocumentKind::all().len());
        for kind in DocumentKind::all() {
            let external_id = self
                .latest_document(idea_id, *kind)?
                .and_then(|d| d.external_id);
            context.push((*kind, external_id));
        }
        Ok(context)
    }
}

// ── Privileged operations ────────────────────────────────────────────

impl<'a> SystemScope<'a> {
    pub(crate) fn tx(&self) -> &Transaction<'a> {
        self.tx
    }

    pub fn document(&self, id: i64) -> Result<Option<Document>> {
        let mut stmt = self
            .tx
            .prepare(&format!(
                "SELECT {DOCUMENT_COLS} FROM documents WHERE id = ?1"
            ))
            .context("Failed to prepare document lookup")?;
        let mut rows = stmt
            .query_map(params![id], document_row)
            .context("Failed to query document")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read document row")?.try_into()?)),
            None => Ok(None),
        }
    }

    /// Exact external-id match among documents of that kind for the idea.
    pub fn document_by_external_id(
        &self,
        idea_id: i64,
        kind: DocumentKind,
        external_id: &str,
    ) -> Result<Option<Document>> {
        let mut stmt = self
            .tx
            .prepare(&format!(
                "SELECT {DOCUMENT_COLS} FROM documents
                 WHERE idea_id = ?1 AND kind = ?2 AND external_id = ?3
                 ORDER BY id DESC LIMIT 1"
            ))
            .context("Failed to prepare external id lookup")?;
        let mut rows = stmt
            .query_map(params![idea_id, kind.as_str(), external_id], document_row)
            .context("Failed to query document by external id")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read document row")?.try_into()?)),
            None => Ok(None),
        }
    }

    pub fn latest_document(&self, idea_id: i64, kind: DocumentKind) -> Result<Option<Document>> {
        let mut stmt = self
            .tx
            .prepare(&format!(
                "SELECT {DOCUMENT_COLS} FROM documents
                 WHERE idea_id = ?1 AND kind = ?2 ORDER BY id DESC LIMIT 1"
            ))
            .context("Failed to prepare latest document lookup")?;
        let mut rows = stmt
            .query_map(params![idea_id, kind.as_str()], document_row)
            .context("Failed to query latest document")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read document row")?.try_into()?)),
            None => Ok(None),
        }
    }

    /// Atomic conditional promotion to a terminal state. Returns false when
    /// the document already reached a terminal state — concurrent
    /// reconciliation and sweeping resolve to exactly one transition.
    /// Content is only written alongside the transition; the external id is
    /// monotonic.
    pub fn finalize_document(
        &self,
        document_id: i64,
        status: DocumentStatus,
        content: Option<&str>,
        external_id: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let changed = self
            .tx
            .execute(
                "UPDATE documents
                 SET status = ?1,
                     content = COALESCE(?2, content),
                     external_id = COALESCE(external_id, ?3),
                     updated_at = datetime('now')
                 WHERE id = ?4 AND status NOT IN ('completed', 'failed')",
                params![status.as_str(), content, external_id, document_id],
            )
            .context("Failed to finalize document")?;
        Ok(changed > 0)
    }

    /// Documents stuck in `generating` for longer than `older_than_secs`.
    pub fn stuck_documents(&self, older_than_secs: u64) -> Result<Vec<Document>> {
        let modifier = format!("-{} seconds", older_than_secs);
        let mut stmt = self
            .tx
            .prepare(&format!(
                "SELECT {DOCUMENT_COLS} FROM documents
                 WHERE status = 'generating'
                   AND generation_started_at IS NOT NULL
                   AND generation_started_at < datetime('now', ?1)
                 ORDER BY id"
            ))
            .context("Failed to prepare stuck document scan")?;
        let rows = stmt
            .query_map(params![modifier], document_row)
            .context("Failed to query stuck documents")?;
        collect_documents(rows)
    }
}

// ── Row mapping ──────────────────────────────────────────────────────

const DOCUMENT_COLS: &str = "id, idea_id, tenant_id, kind, status, content, external_id, \
                             generation_started_at, created_at, updated_at";

fn idea_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Idea> {
    Ok(Idea {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Raw document row; kind/status strings are converted after the query so
/// rusqlite's row mapping stays infallible.
pub(crate) struct DocumentRow {
    id: i64,
    idea_id: i64,
    tenant_id: i64,
    kind: String,
    status: String,
    content: String,
    external_id: Option<String>,
    generation_started_at: Option<String>,
    created_at: String,
    updated_at: String,
}

pub(crate) fn document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok(DocumentRow {
        id: row.get(0)?,
        idea_id: row.get(1)?,
        tenant_id: row.get(2)?,
        kind: row.get(3)?,
        status: row.get(4)?,
        content: row.get(5)?,
        external_id: row.get(6)?,
        generation_started_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl TryFrom<DocumentRow> for Document {
    type Error = anyhow::Error;

    fn try_from(row: DocumentRow) -> Result<Self> {
        Ok(Document {
            id: row.id,
            idea_id: row.idea_id,
            tenant_id: row.tenant_id,
            kind: row.kind.parse().map_err(anyhow::Error::msg)?,
            status: row.status.parse().map_err(anyhow::Error::msg)?,
            content: row.content,
            external_id: row.external_id,
            generation_started_at: row.generation_started_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn collect_documents(
    rows: impl Iterator<Item = rusqlite::Result<DocumentRow>>,
) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for row in rows {
        documents.push(row.context("Failed to read document row")?.try_into()?);
    }
    Ok(documents)
}
