//! Reconciliation: converging stored state with external generation results.
//!
//! Results arrive over two independent paths — push (webhook) and pull
//! (polling the external record store) — that may race each other and the
//! timeout sweeper. All three funnel into [`Reconciler::apply`], whose
//! terminal transitions are conditional updates: whichever path gets there
//! first wins, the others observe a no-op, and exactly one done/error event
//! fans out per job.

pub mod poll;
pub mod webhook;

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use crate::errors::ReconcileError;
use crate::events::{EventHub, EventKind};
use crate::store::{
    DbHandle, Document, DocumentKind, DocumentStatus, GenerationJob, JobStatus,
};

/// A terminal generation result, normalized from whichever path carried it.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub idea_id: i64,
    pub kind: DocumentKind,
    pub status: DocumentStatus,
    pub content: Option<String>,
    pub external_id: Option<String>,
}

/// What `apply` did: the document after reconciliation, the tracking job if
/// one existed, and whether this call performed the terminal transition.
#[derive(Debug)]
pub struct Applied {
    pub document: Document,
    pub job: Option<GenerationJob>,
    pub transitioned: bool,
}

pub struct Reconciler {
    db: DbHandle,
    hub: Arc<EventHub>,
}

impl Reconciler {
    pub fn new(db: DbHandle, hub: Arc<EventHub>) -> Self {
        Self { db, hub }
    }

    /// Apply a generation outcome idempotently.
    ///
    /// The document is located by exact external id first, falling back to
    /// the latest document of the kind — generators sometimes report ids the
    /// dispatch side never learned. Document and job are finalized with
    /// conditional transitions; the fan-out event is published only when the
    /// job actually transitioned here.
    pub async fn apply(&self, outcome: GenerationOutcome) -> Result<Applied, ReconcileError> {
        debug_assert!(outcome.status.is_terminal());
        let applied = self
            .db
            .call(move |db| {
                db.with_system_scope(|sys| {
                    let located = match &outcome.external_id {
                        Some(external_id) => sys.document_by_external_id(
                            outcome.idea_id,
                            outcome.kind,
                            external_id,
                        )?,
                        None => None,
                    };
                    let document = match located {
                        Some(document) => document,
                        None => sys
                            .latest_document(outcome.idea_id, outcome.kind)?
                            .ok_or_else(|| ReconcileError::NoMatchingDocument {
                                idea_id: outcome.idea_id,
                                kind: outcome.kind.as_str().to_string(),
                            })?,
                    };

                    sys.finalize_document(
                        document.id,
                        outcome.status,
                        outcome.content.as_deref(),
                        outcome.external_id.as_deref(),
                    )?;

                    let mut transitioned = false;
                    let job = match sys.active_job(outcome.idea_id, outcome.kind)? {
                        Some(job) => {
                            let (job_status, progress) = match outcome.status {
                                DocumentStatus::Failed => {
                                    (JobStatus::Failed, "Generation failed")
                                }
                                _ => (JobStatus::Completed, "Generation completed"),
                            };
                            transitioned = sys.finalize_job(&job.id, job_status, progress)?;
                            sys.job(&job.id)?
                        }
                        None => None,
                    };

                    let document = sys
                        .document(document.id)?
                        .context("Document missing after reconciliation")?;
                    Ok(Applied {
                        document,
                        job,
                        transitioned,
                    })
                })
            })
            .await
            .map_err(|e| match e.downcast::<ReconcileError>() {
                Ok(reconcile) => reconcile,
                Err(other) => ReconcileError::Other(other),
            })?;

        if applied.transitioned {
            if let Some(job) = &applied.job {
                let (kind, data) = match job.status {
                    JobStatus::Failed => (
                        EventKind::Error,
                        json!({
                            "job_id": job.id,
                            "status": job.status,
                            "kind": job.kind,
                            "error": job.progress,
                        }),
                    ),
                    _ => (
                        EventKind::Done,
                        json!({
                            "job_id": job.id,
                            "status": job.status,
                            "kind": job.kind,
                            "document_id": applied.document.id,
                        }),
                    ),
                };
                self.hub.publish(&job.id, kind, data);
            }
        }
        Ok(applied)
    }
}
