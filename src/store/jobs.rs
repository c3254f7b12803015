//! Job Store: durable records of generation attempts.
//!
//! Jobs are created by the dispatcher, mutated by the reconciliation layer
//! or the sweeper, and never physically deleted. `update_job` is data-only:
//! it applies whatever patch it is given and performs no state-machine
//! validation. Transitions that can race reconciliation go through the
//! conditional operations instead: `begin_processing` for the ack path and
//! `finalize_job` for the terminal states.

use anyhow::{Context, Result};
use rusqlite::params;
use uuid::Uuid;

use super::gateway::{SystemScope, TenantScope};
use super::models::*;

const JOB_COLS: &str = "id, tenant_id, idea_id, kind, status, progress, created_at, updated_at";

struct JobRow {
    id: String,
    tenant_id: i64,
    idea_id: i64,
    kind: String,
    status: String,
    progress: String,
    created_at: String,
    updated_at: String,
}

fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        idea_id: row.get(2)?,
        kind: row.get(3)?,
        status: row.get(4)?,
        progress: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl TryFrom<JobRow> for GenerationJob {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(GenerationJob {
            id: row.id,
            tenant_id: row.tenant_id,
            idea_id: row.idea_id,
            kind: row.kind.parse().map_err(anyhow::Error::msg)?,
            status: row.status.parse().map_err(anyhow::Error::msg)?,
            progress: row.progress,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ── Tenant-scoped job operations ─────────────────────────────────────

impl TenantScope<'_> {
    /// Create a job in its initial `pending` state.
    pub fn create_job(&self, idea_id: i64, kind: DocumentKind) -> Result<GenerationJob> {
        let id = Uuid::new_v4().to_string();
        self.tx()
            .execute(
                "INSERT INTO jobs (id, tenant_id, idea_id, kind, status, progress)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 'Generation requested')",
                params![id, self.tenant_id(), idea_id, kind.as_str()],
            )
            .context("Failed to insert job")?;
        self.job(&id)?.context("Job not found after insert")
    }

    pub fn job(&self, id: &str) -> Result<Option<GenerationJob>> {
        let mut stmt = self
            .tx()
            .prepare(&format!("SELECT {JOB_COLS} FROM tenant_jobs WHERE id = ?1"))
            .context("Failed to prepare job lookup")?;
        let mut rows = stmt
            .query_map(params![id], job_row)
            .context("Failed to query job")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read job row")?.try_into()?)),
            None => Ok(None),
        }
    }

    /// The most recent job for the idea, optionally restricted to one kind.
    /// A NULL kind parameter matches every kind.
    pub fn latest_job(
        &self,
        idea_id: i64,
        kind: Option<DocumentKind>,
    ) -> Result<Option<GenerationJob>> {
        let mut stmt = self
            .tx()
            .prepare(&format!(
                "SELECT {JOB_COLS} FROM tenant_jobs
                 WHERE idea_id = ?1 AND (?2 IS NULL OR kind = ?2)
                 ORDER BY created_at DESC, rn DESC LIMIT 1"
            ))
            .context("Failed to prepare latest job lookup")?;
        let mut rows = stmt
            .query_map(params![idea_id, kind.map(|k| k.as_str())], job_row)
            .context("Failed to query latest job")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read job row")?.try_into()?)),
            None => Ok(None),
        }
    }

    /// The non-terminal job of this kind, if one exists. Used as the
    /// duplicate-submission guard: a tenant holds at most one active job per
    /// (idea, kind).
    pub fn active_job(&self, idea_id: i64, kind: DocumentKind) -> Result<Option<GenerationJob>> {
        let mut stmt = self
            .tx()
            .prepare(&format!(
                "SELECT {JOB_COLS} FROM tenant_jobs
                 WHERE idea_id = ?1 AND kind = ?2
                   AND status NOT IN ('completed', 'failed')
                 ORDER BY created_at DESC, rn DESC LIMIT 1"
            ))
            .context("Failed to prepare active job lookup")?;
        let mut rows = stmt
            .query_map(params![idea_id, kind.as_str()], job_row)
            .context("Failed to query active job")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read job row")?.try_into()?)),
            None => Ok(None),
        }
    }

    /// Apply a partial update. Data-only: no transition validation.
    pub fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Option<GenerationJob>> {
        apply_patch(self.tx(), id, patch)?;
        self.job(id)
    }

    /// Promote a pending job to `processing`. Conditional like the terminal
    /// transitions: returns false when the job already left `pending` —
    /// a webhook can close the job while the generator ack is still in
    /// flight, and that terminal state must not be overwritten.
    pub fn begin_processing(&self, id: &str, progress: &str) -> Result<bool> {
        let changed = self
            .tx()
            .execute(
                "UPDATE jobs
                 SET status = 'processing', progress = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND tenant_id = ?3 AND status = 'pending'",
                params![progress, id, self.tenant_id()],
            )
            .context("Failed to promote job to processing")?;
        Ok(changed > 0)
    }
}

// ── Privileged job operations ────────────────────────────────────────
//
// Webhook ingestion and the sweeper act before (or without) a
// request-scoped tenant; they are trusted internal code paths.

impl SystemScope<'_> {
    pub fn job(&self, id: &str) -> Result<Option<GenerationJob>> {
        let mut stmt = self
            .tx()
            .prepare(&format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1"))
            .context("Failed to prepare job lookup")?;
        let mut rows = stmt
            .query_map(params![id], job_row)
            .context("Failed to query job")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read job row")?.try_into()?)),
            None => Ok(None),
        }
    }

    pub fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Option<GenerationJob>> {
        apply_patch(self.tx(), id, patch)?;
        self.job(id)
    }

    /// The non-terminal job for (idea, kind), used by reconciliation to find
    /// the tracking record matching an inbound result.
    pub fn active_job(&self, idea_id: i64, kind: DocumentKind) -> Result<Option<GenerationJob>> {
        let mut stmt = self
            .tx()
            .prepare(&format!(
                "SELECT {JOB_COLS} FROM jobs
                 WHERE idea_id = ?1 AND kind = ?2
                   AND status NOT IN ('completed', 'failed')
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ))
            .context("Failed to prepare active job lookup")?;
        let mut rows = stmt
            .query_map(params![idea_id, kind.as_str()], job_row)
            .context("Failed to query active job")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read job row")?.try_into()?)),
            None => Ok(None),
        }
    }

    /// Atomic conditional promotion to a terminal status. Returns false when
    /// the job is already terminal, so concurrent reconciliation and
    /// sweeping produce exactly one transition (and one fan-out event).
    pub fn finalize_job(&self, id: &str, status: JobStatus, progress: &str) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let changed = self
            .tx()
            .execute(
                "UPDATE jobs
                 SET status = ?1, progress = ?2, updated_at = datetime('now')
                 WHERE id = ?3 AND status NOT IN ('completed', 'failed')",
                params![status.as_str(), progress, id],
            )
            .context("Failed to finalize job")?;
        Ok(changed > 0)
    }
}

fn apply_patch(tx: &rusqlite::Transaction<'_>, id: &str, patch: &JobPatch) -> Result<()> {
    tx.execute(
        "UPDATE jobs
         SET status = COALESCE(?1, status),
             progress = COALESCE(?2, progress),
             updated_at = datetime('now')
         WHERE id = ?3",
        params![
            patch.status.map(|s| s.as_str()),
            patch.progress.as_deref(),
            id
        ],
    )
    .context("Failed to update job")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StudioDb;

    fn setup() -> (StudioDb, i64, i64, i64) {
        let db = StudioDb::new_in_memory().unwrap();
        let a = db.create_tenant("tenant-a", "tok-a").unwrap().id;
        let b = db.create_tenant("tenant-b", "tok-b").unwrap().id;
        let idea = db
            .with_tenant_scope(a, |scope| scope.create_idea("Meal kit", ""))
            .unwrap();
        (db, a, b, idea.id)
    }

    #[test]
    fn test_create_job_is_pending_with_uuid() {
        let (db, a, _, idea_id) = setup();
        let job = db
            .with_tenant_scope(a, |s| s.create_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(Uuid::parse_str(&job.id).is_ok());
        assert_eq!(job.idea_id, idea_id);
    }

    #[test]
    fn test_jobs_invisible_across_tenants() {
        let (db, a, b, idea_id) = setup();
        let job = db
            .with_tenant_scope(a, |s| s.create_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();

        let leaked = db.with_tenant_scope(b, |s| s.job(&job.id)).unwrap();
        assert!(leaked.is_none());

        // The trusted system path can see it (webhook ingestion needs this).
        let seen = db.with_system_scope(|s| s.job(&job.id)).unwrap();
        assert!(seen.is_some());
    }

    #[test]
    fn test_update_job_is_data_only() {
        let (db, a, _, idea_id) = setup();
        let job = db
            .with_tenant_scope(a, |s| s.create_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();

        let updated = db
            .with_tenant_scope(a, |s| {
                s.update_job(
                    &job.id,
                    &JobPatch {
                        status: Some(JobStatus::Processing),
                        progress: Some("Generator acknowledged".into()),
                    },
                )
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, JobStatus::Processing);
        assert_eq!(updated.progress, "Generator acknowledged");

        // Partial patch leaves untouched fields alone.
        let updated = db
            .with_tenant_scope(a, |s| {
                s.update_job(
                    &job.id,
                    &JobPatch {
                        status: None,
                        progress: Some("still working".into()),
                    },
                )
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, JobStatus::Processing);
    }

    #[test]
    fn test_begin_processing_only_from_pending() {
        let (db, a, _, idea_id) = setup();
        let job = db
            .with_tenant_scope(a, |s| s.create_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();

        let promoted = db
            .with_tenant_scope(a, |s| s.begin_processing(&job.id, "Generator acknowledged"))
            .unwrap();
        assert!(promoted);

        // A second promotion is a no-op, and a finalized job stays terminal.
        let again = db
            .with_tenant_scope(a, |s| s.begin_processing(&job.id, "late ack"))
            .unwrap();
        assert!(!again);

        db.with_system_scope(|s| s.finalize_job(&job.id, JobStatus::Completed, "done"))
            .unwrap();
        let after_terminal = db
            .with_tenant_scope(a, |s| s.begin_processing(&job.id, "stray ack"))
            .unwrap();
        assert!(!after_terminal);

        let job = db.with_system_scope(|s| s.job(&job.id)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, "done");
    }

    #[test]
    fn test_active_job_guard() {
        let (db, a, _, idea_id) = setup();
        let job = db
            .with_tenant_scope(a, |s| s.create_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();

        let active = db
            .with_tenant_scope(a, |s| s.active_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();
        assert_eq!(active.unwrap().id, job.id);

        // Other kinds are unaffected.
        let active = db
            .with_tenant_scope(a, |s| s.active_job(idea_id, DocumentKind::Workflows))
            .unwrap();
        assert!(active.is_none());

        // Terminal jobs no longer count as active.
        db.with_system_scope(|s| s.finalize_job(&job.id, JobStatus::Completed, "done"))
            .unwrap();
        let active = db
            .with_tenant_scope(a, |s| s.active_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();
        assert!(active.is_none());
    }

    #[test]
    fn test_finalize_job_exactly_once() {
        let (db, a, _, idea_id) = setup();
        let job = db
            .with_tenant_scope(a, |s| s.create_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();

        let first = db
            .with_system_scope(|s| s.finalize_job(&job.id, JobStatus::Completed, "done"))
            .unwrap();
        let second = db
            .with_system_scope(|s| s.finalize_job(&job.id, JobStatus::Failed, "late failure"))
            .unwrap();
        assert!(first);
        assert!(!second);

        let job = db.with_system_scope(|s| s.job(&job.id)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, "done");
    }

    #[test]
    fn test_latest_job_orders_by_recency() {
        let (db, a, _, idea_id) = setup();
        let first = db
            .with_tenant_scope(a, |s| s.create_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();
        db.with_system_scope(|s| s.finalize_job(&first.id, JobStatus::Failed, "boom"))
            .unwrap();
        let second = db
            .with_tenant_scope(a, |s| s.create_job(idea_id, DocumentKind::LeanCanvas))
            .unwrap();

        let latest = db
            .with_tenant_scope(a, |s| s.latest_job(idea_id, Some(DocumentKind::LeanCanvas)))
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);

        let latest_any = db
            .with_tenant_scope(a, |s| s.latest_job(idea_id, None))
            .unwrap()
            .unwrap();
        assert_eq!(latest_any.id, second.id);
    }
}
