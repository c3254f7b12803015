//! Pull-side reconciliation: polling the external record store.
//!
//! Polling is piggybacked on document reads instead of running on its own
//! timer: when a tenant fetches a document that is still `generating`, the
//! external record store is consulted and any terminal result is applied
//! through the same reconciler the webhook path uses. A dwell gate skips
//! the lookup for the first seconds after dispatch, before the generator
//! can have registered the record.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::config::RecordsSettings;
use crate::store::{DbHandle, Document, DocumentKind, DocumentStatus};

use super::{GenerationOutcome, Reconciler};

/// A generation record as the external store reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalRecord {
    pub status: Option<String>,
    #[serde(alias = "content")]
    pub html: Option<String>,
}

/// Lookup seam over the external record store. `fetch` returns None when
/// the store does not know the id (yet).
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch(&self, external_id: &str) -> Result<Option<ExternalRecord>>;
}

pub struct HttpRecordFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecordFetcher {
    pub fn new(settings: &RecordsSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build record store HTTP client")?;
        Ok(Self {
            client,
            base_url: settings.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RecordFetcher for HttpRecordFetcher {
    async fn fetch(&self, external_id: &str) -> Result<Option<ExternalRecord>> {
        let url = format!("{}/{}", self.base_url, external_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("Record store request failed")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("Record store returned {}", resp.status());
        }
        let record = resp
            .json::<ExternalRecord>()
            .await
            .context("Failed to decode record store response")?;
        Ok(Some(record))
    }
}

/// True once `dwell_secs` have passed since the SQLite timestamp
/// `started_at`. An unparseable timestamp never blocks polling.
fn dwell_elapsed(started_at: &str, dwell_secs: u64, now: DateTime<Utc>) -> bool {
    match NaiveDateTime::parse_from_str(started_at, "%Y-%m-%d %H:%M:%S") {
        Ok(naive) => {
            let started = naive.and_utc();
            now >= started + chrono::Duration::seconds(dwell_secs as i64)
        }
        Err(_) => true,
    }
}

pub struct Poller {
    db: DbHandle,
    fetcher: Arc<dyn RecordFetcher>,
    reconciler: Reconciler,
    dwell_secs: u64,
}

impl Poller {
    pub fn new(
        db: DbHandle,
        fetcher: Arc<dyn RecordFetcher>,
        reconciler: Reconciler,
        dwell_secs: u64,
    ) -> Self {
        Self {
            db,
            fetcher,
            reconciler,
            dwell_secs,
        }
    }

    /// Return the latest document of the kind, first reconciling it against
    /// the external record store when it is still generating. Missing
    /// records, pending records, and dwell-gated reads all leave the
    /// document as stored.
    pub async fn refresh(
        &self,
        tenant_id: i64,
        idea_id: i64,
        kind: DocumentKind,
    ) -> Result<Option<Document>> {
        let document = self
            .db
            .call(move |db| {
                db.with_tenant_scope(tenant_id, |scope| scope.latest_document(idea_id, kind))
            })
            .await?;
        let document = match document {
            Some(document) => document,
            None => return Ok(None),
        };
        if document.status != DocumentStatus::Generating {
            return Ok(Some(document));
        }
        let external_id = match &document.external_id {
            Some(id) => id.clone(),
            None => return Ok(Some(document)),
        };
        if let Some(started_at) = &document.generation_started_at {
            if !dwell_elapsed(started_at, self.dwell_secs, Utc::now()) {
                return Ok(Some(document));
            }
        }

        let record = match self.fetcher.fetch(&external_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(Some(document)),
            Err(e) => {
                // A record-store outage degrades to a stale read.
                tracing::warn!(external_id = %external_id, error = %format!("{e:#}"), "Record store lookup failed");
                return Ok(Some(document));
            }
        };

        let status = match record.status.as_deref() {
            Some("failed") | Some("error") => DocumentStatus::Failed,
            Some("completed") | Some("done") | Some("ready") => DocumentStatus::Completed,
            // Records without a recognized status count as completed only
            // once they carry content.
            _ if record.html.is_some() => DocumentStatus::Completed,
            _ => return Ok(Some(document)),
        };

        let applied = self
            .reconciler
            .apply(GenerationOutcome {
                idea_id,
                kind,
                status,
                content: record.html,
                external_id: Some(external_id),
            })
            .await?;
        Ok(Some(applied.document))
    }
}
