//! Generation dispatch: job creation and generator invocation.
//!
//! Dispatch commits the pending job and the `generating` document before
//! the network call, so no database transaction is ever held across
//! generator I/O. The invocation outcome is recorded in a second scope:
//! acknowledgement promotes the job to `processing` unless reconciliation
//! already closed it, failure finalizes job and document as `failed` and
//! fans out an error event.

pub mod client;
pub mod extract;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use client::{GenerationRequest, GeneratorAck, GeneratorTransport, HttpGenerator, TokenCache};

use anyhow::Context;
use serde_json::json;

use crate::errors::DispatchError;
use crate::events::{EventHub, EventKind};
use crate::store::{DbHandle, DocumentKind, GenerationJob, JobStatus};

pub struct Dispatcher {
    db: DbHandle,
    hub: Arc<EventHub>,
    transport: Arc<dyn GeneratorTransport>,
}

enum Prepared {
    /// A non-terminal job of this kind already exists; dispatch is a no-op.
    Existing(GenerationJob),
    Created {
        job: GenerationJob,
        document_id: i64,
        request: GenerationRequest,
    },
}

impl Dispatcher {
    pub fn new(db: DbHandle, hub: Arc<EventHub>, transport: Arc<dyn GeneratorTransport>) -> Self {
        Self { db, hub, transport }
    }

    /// Request generation of a document kind for an idea.
    ///
    /// Idempotent per (idea, kind): if a non-terminal job already exists it
    /// is returned unchanged instead of invoking the generator again. The
    /// returned job reflects the invocation outcome — `processing` when the
    /// generator acknowledged, `failed` when the invocation failed.
    pub async fn dispatch(
        &self,
        tenant_id: i64,
        idea_id: i64,
        kind: DocumentKind,
        instructions: String,
    ) -> Result<GenerationJob, DispatchError> {
        let prepared = self
            .db
            .call(move |db| {
                db.with_tenant_scope(tenant_id, |scope| {
                    if scope.idea(idea_id)?.is_none() {
                        return Err(DispatchError::IdeaNotFound { id: idea_id }.into());
                    }
                    if let Some(job) = scope.active_job(idea_id, kind)? {
                        return Ok(Prepared::Existing(job));
                    }

                    let job = scope.create_job(idea_id, kind)?;
                    let document = scope.begin_generation(idea_id, kind)?;
                    let context: BTreeMap<String, Option<String>> = scope
                        .upstream_context(idea_id)?
                        .into_iter()
                        .map(|(k, id)| (k.as_str().to_string(), id))
                        .collect();
                    Ok(Prepared::Created {
                        job,
                        document_id: document.id,
                        request: GenerationRequest {
                            idea_id,
                            kind,
                            instructions: instructions.clone(),
                            context,
                        },
                    })
                })
            })
            .await
            .map_err(|e| match e.downcast::<DispatchError>() {
                Ok(dispatch) => dispatch,
                Err(other) => DispatchError::Other(other),
            })?;

        let (job, document_id, request) = match prepared {
            Prepared::Existing(job) => {
                tracing::debug!(
                    job_id = %job.id,
                    idea_id,
                    kind = %kind,
                    "Duplicate dispatch; returning active job"
                );
                return Ok(job);
            }
            Prepared::Created {
                job,
                document_id,
                request,
            } => (job, document_id, request),
        };

        match self.transport.invoke(&request).await {
            Ok(ack) => self.record_acknowledgement(tenant_id, &job, document_id, &ack).await,
            Err(e) => self.record_failure(&job, document_id, &e).await,
        }
    }

    async fn record_acknowledgement(
        &self,
        tenant_id: i64,
        job: &GenerationJob,
        document_id: i64,
        ack: &GeneratorAck,
    ) -> Result<GenerationJob, DispatchError> {
        let external_id = extract::correlation_id(&ack.body);
        if external_id.is_none() {
            tracing::warn!(
                job_id = %job.id,
                "Generator response carried no usable correlation id"
            );
        }

        let job_id = job.id.clone();
        let (updated, transitioned) = self
            .db
            .call(move |db| {
                db.with_tenant_scope(tenant_id, |scope| {
                    if let Some(id) = &external_id {
                        scope.record_external_id(document_id, id)?;
                    }
                    // Conditional: a fast webhook can finalize the job before
                    // the ack lands, and that terminal state wins.
                    let transitioned =
                        scope.begin_processing(&job_id, "Generator acknowledged")?;
                    let job = scope
                        .job(&job_id)?
                        .context("Job missing after acknowledgement")?;
                    Ok((job, transitioned))
                })
            })
            .await?;

        if transitioned {
            self.hub.publish(
                &updated.id,
                EventKind::Status,
                json!({
                    "job_id": updated.id,
                    "status": updated.status,
                    "kind": updated.kind,
                    "progress": updated.progress,
                }),
            );
        }
        Ok(updated)
    }

    async fn record_failure(
        &self,
        job: &GenerationJob,
        document_id: i64,
        error: &anyhow::Error,
    ) -> Result<GenerationJob, DispatchError> {
        tracing::warn!(job_id = %job.id, error = %format!("{error:#}"), "Generator invocation failed");

        let job_id = job.id.clone();
        let progress = format!("Generator invocation failed: {error:#}");
        let (updated, transitioned) = self
            .db
            .call(move |db| {
                db.with_system_scope(|sys| {
                    let transitioned = sys.finalize_job(&job_id, JobStatus::Failed, &progress)?;
                    sys.finalize_document(document_id, crate::store::DocumentStatus::Failed, None, None)?;
                    let job = sys.job(&job_id)?.context("Job missing after failure")?;
                    Ok((job, transitioned))
                })
            })
            .await?;

        if transitioned {
            self.hub.publish(
                &updated.id,
                EventKind::Error,
                json!({
                    "job_id": updated.id,
                    "status": updated.status,
                    "kind": updated.kind,
                    "error": updated.progress,
                }),
            );
        }
        Ok(updated)
    }
}
