//! Inbound webhook ingestion: authentication and payload normalization.
//!
//! Generators call back with loosely-shaped JSON. The payload is normalized
//! into a [`GenerationOutcome`] here; the HTTP handler in the API layer owns
//! status codes and calls [`Reconciler::apply`] with the result.

use axum::http::HeaderMap;
use base64::Engine;
use serde::Deserialize;

use crate::config::WebhookSettings;
use crate::errors::ReconcileError;
use crate::store::{DocumentKind, DocumentStatus};

use super::GenerationOutcome;

pub const SECRET_HEADER: &str = "x-webhook-secret";

/// Raw webhook body. Field aliases absorb the shape drift between generator
/// versions.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub idea_id: Option<i64>,
    pub kind: Option<String>,
    pub status: Option<String>,
    #[serde(alias = "content")]
    pub html: Option<String>,
    #[serde(alias = "id", alias = "record_id")]
    pub external_id: Option<String>,
}

/// Check webhook credentials: a matching shared-secret header, or Basic
/// credentials when those are configured. With neither configured, every
/// request is rejected.
pub fn authorize(settings: &WebhookSettings, headers: &HeaderMap) -> bool {
    if let Some(secret) = &settings.secret {
        if let Some(provided) = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()) {
            if provided == secret {
                return true;
            }
        }
    }
    if let (Some(user), Some(pass)) = (&settings.basic_user, &settings.basic_pass) {
        if let Some(value) = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(encoded) = value.strip_prefix("Basic ") {
                if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) {
                    if let Ok(decoded) = String::from_utf8(decoded) {
                        if decoded == format!("{user}:{pass}") {
                            return true;
                        }
                    }
                }
            }
        }
    }
    false
}

/// Normalize a webhook payload into a terminal outcome. The document kind
/// may come from the payload or from the route path (`kind_hint`); a status
/// of `failed` or `error` maps to a failed document, anything else counts as
/// completed.
pub fn outcome_from_payload(
    payload: WebhookPayload,
    kind_hint: Option<DocumentKind>,
) -> Result<GenerationOutcome, ReconcileError> {
    let idea_id = payload.idea_id.ok_or(ReconcileError::MissingSubject)?;
    let kind = payload
        .kind
        .as_deref()
        .and_then(|k| k.parse::<DocumentKind>().ok())
        .or(kind_hint)
        .ok_or(ReconcileError::MissingKind)?;
    let status = match payload.status.as_deref() {
        Some("failed") | Some("error") => DocumentStatus::Failed,
        _ => DocumentStatus::Completed,
    };
    Ok(GenerationOutcome {
        idea_id,
        kind,
        status,
        content: payload.html,
        external_id: payload.external_id,
    })
}
