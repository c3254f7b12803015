//! Timeout sweeper: a background reconciliation path of last resort.
//!
//! Generators sometimes finish without ever reporting back — a lost
//! webhook, a record the poll path never sees. Documents stuck in
//! `generating` past the configured timeout are promoted to a terminal
//! status on a fixed interval. The promotion target is configurable:
//! `completed` trusts that the external system usually finished and only
//! the callback was lost, `failed` is the conservative reading. Either way
//! the transition is conditional, so a late webhook and the sweeper resolve
//! to exactly one outcome.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crate::config::{SweepOutcome, SweeperSettings};
use crate::events::{EventHub, EventKind};
use crate::store::{DbHandle, DocumentStatus, GenerationJob, JobStatus};

pub struct Sweeper {
    db: DbHandle,
    hub: Arc<EventHub>,
    interval: Duration,
    timeout_secs: u64,
    promote_to: SweepOutcome,
}

struct SweptJob {
    job: GenerationJob,
    document_id: i64,
}

impl Sweeper {
    pub fn new(
        db: DbHandle,
        hub: Arc<EventHub>,
        settings: &SweeperSettings,
        generation_timeout_secs: u64,
    ) -> Self {
        Self {
            db,
            hub,
            interval: Duration::from_secs(settings.interval_secs),
            timeout_secs: generation_timeout_secs,
            promote_to: settings.promote_to,
        }
    }

    /// Run the sweep loop until the task is dropped at shutdown.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.sweep_once().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "Promoted timed-out generations"),
                    Err(e) => tracing::error!(error = %format!("{e:#}"), "Sweep failed"),
                }
            }
        })
    }

    /// One pass over stuck documents. Returns how many documents this call
    /// promoted; already-terminal rows touched by a racing path count zero.
    pub async fn sweep_once(&self) -> Result<usize> {
        let timeout_secs = self.timeout_secs;
        let (doc_status, job_status, progress) = match self.promote_to {
            SweepOutcome::Completed => (
                DocumentStatus::Completed,
                JobStatus::Completed,
                "Generation assumed complete after timeout",
            ),
            SweepOutcome::Failed => (
                DocumentStatus::Failed,
                JobStatus::Failed,
                "Generation timed out",
            ),
        };

        let (promoted, swept_jobs) = self
            .db
            .call(move |db| {
                db.with_system_scope(|sys| {
                    let mut promoted = 0;
                    let mut swept_jobs = Vec::new();
                    for document in sys.stuck_documents(timeout_secs)? {
                        if !sys.finalize_document(document.id, doc_status, None, None)? {
                            continue;
                        }
                        promoted += 1;
                        if let Some(job) = sys.active_job(document.idea_id, document.kind)? {
                            if sys.finalize_job(&job.id, job_status, progress)? {
                                if let Some(job) = sys.job(&job.id)? {
                                    swept_jobs.push(SweptJob {
                                        job,
                                        document_id: document.id,
                                    });
                                }
                            }
                        }
                    }
                    Ok((promoted, swept_jobs))
                })
            })
            .await?;

        for swept in &swept_jobs {
            let (kind, data) = match swept.job.status {
                JobStatus::Failed => (
                    EventKind::Error,
                    json!({
                        "job_id": swept.job.id,
                        "status": swept.job.status,
                        "kind": swept.job.kind,
                        "error": swept.job.progress,
                    }),
                ),
                _ => (
                    EventKind::Done,
                    json!({
                        "job_id": swept.job.id,
                        "status": swept.job.status,
                        "kind": swept.job.kind,
                        "document_id": swept.document_id,
                    }),
                ),
            };
            self.hub.publish(&swept.job.id, kind, data);
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentKind, StudioDb};
    use rusqlite::params;

    async fn setup(promote_to: SweepOutcome) -> (Sweeper, DbHandle, Arc<EventHub>, i64, i64, String) {
        let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
        let (tenant_id, idea_id, job_id) = db
            .call(|db| {
                let tenant = db.create_tenant("acme", "tok")?;
                let (idea_id, job_id) = db.with_tenant_scope(tenant.id, |scope| {
                    let idea = scope.create_idea("Meal kit", "")?;
                    let job = scope.create_job(idea.id, DocumentKind::LeanCanvas)?;
                    scope.begin_generation(idea.id, DocumentKind::LeanCanvas)?;
                    Ok((idea.id, job.id))
                })?;
                Ok((tenant.id, idea_id, job_id))
            })
            .await
            .unwrap();
        let hub = Arc::new(EventHub::new());
        let settings = SweeperSettings {
            interval_secs: 30,
            promote_to,
        };
        let sweeper = Sweeper::new(db.clone(), hub.clone(), &settings, 120);
        (sweeper, db, hub, tenant_id, idea_id, job_id)
    }

    async fn backdate(db: &DbHandle) {
        db.call(|db| {
            db.conn()
                .execute(
                    "UPDATE documents SET generation_started_at = datetime('now', '-10 minutes')",
                    params![],
                )
                .map_err(anyhow::Error::from)
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_fresh_documents_not_swept() {
        let (sweeper, _, _, _, _, _) = setup(SweepOutcome::Completed).await;
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_promotes_exactly_once() {
        let (sweeper, db, hub, _, idea_id, job_id) = setup(SweepOutcome::Completed).await;
        let mut rx = hub.subscribe(&job_id);
        backdate(&db).await;

        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        // The promoted document is terminal; repeat sweeps find nothing.
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        let (document, job) = db
            .call(move |db| {
                db.with_system_scope(|sys| {
                    let document = sys.latest_document(idea_id, DocumentKind::LeanCanvas)?;
                    let job = sys.job(&job_id)?;
                    Ok((document, job))
                })
            })
            .await
            .unwrap();
        assert_eq!(document.unwrap().status, DocumentStatus::Completed);
        let job = job.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, "Generation assumed complete after timeout");

        // Exactly one done event.
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains(r#""type":"done""#));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_can_promote_to_failed() {
        let (sweeper, db, hub, _, idea_id, job_id) = setup(SweepOutcome::Failed).await;
        let mut rx = hub.subscribe(&job_id);
        backdate(&db).await;

        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        let (document, job) = db
            .call(move |db| {
                db.with_system_scope(|sys| {
                    let document = sys.latest_document(idea_id, DocumentKind::LeanCanvas)?;
                    let job = sys.job(&job_id)?;
                    Ok((document, job))
                })
            })
            .await
            .unwrap();
        assert_eq!(document.unwrap().status, DocumentStatus::Failed);
        assert_eq!(job.unwrap().status, JobStatus::Failed);

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains(r#""type":"error""#));
    }

    #[tokio::test]
    async fn test_sweep_loses_race_to_reconciliation() {
        let (sweeper, db, _, _, idea_id, _) = setup(SweepOutcome::Completed).await;
        backdate(&db).await;

        // A webhook lands first.
        db.call(move |db| {
            db.with_system_scope(|sys| {
                let document = sys
                    .latest_document(idea_id, DocumentKind::LeanCanvas)?
                    .ok_or_else(|| anyhow::anyhow!("missing document"))?;
                sys.finalize_document(document.id, DocumentStatus::Failed, None, None)?;
                Ok(())
            })
        })
        .await
        .unwrap();

        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }
}
