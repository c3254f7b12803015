//! Correlation-id extraction from heterogeneous generator responses.
//!
//! External generators do not share a response shape: some return
//! `{"id": "..."}`, some bury the identifier under a provider-specific key,
//! some return the bare id as plain text. Extraction is an ordered chain of
//! strategies — exact field name, fuzzy field name, short-text fallback —
//! where the first match wins. Absence is non-fatal: reconciliation can
//! still converge by subject + kind lookup.

use serde_json::Value;

/// Ids longer than this are assumed to be error pages or payloads, not
/// identifiers.
const MAX_ID_LEN: usize = 100;

/// Best-effort extraction of a correlation id from a generator response
/// body. Returns None when no strategy produces a plausible id.
pub fn correlation_id(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return exact_id_field(&value).or_else(|| fuzzy_id_field(&value));
    }
    short_text(body)
}

/// Strategy 1: the conventional `id` field at the top level.
fn exact_id_field(value: &Value) -> Option<String> {
    id_candidate(value.as_object()?.get("id")?)
}

/// Strategy 2: any top-level field whose name contains "id" and whose value
/// is a short scalar. Object key order is preserved by serde_json's map, so
/// the first declared candidate wins.
fn fuzzy_id_field(value: &Value) -> Option<String> {
    value
        .as_object()?
        .iter()
        .filter(|(key, _)| key.to_lowercase().contains("id"))
        .find_map(|(_, v)| id_candidate(v))
}

/// Strategy 3: a non-JSON body is treated as the id itself, but only when it
/// is short enough to plausibly be one.
fn short_text(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.len() >= MAX_ID_LEN {
        return None;
    }
    Some(trimmed.to_string())
}

fn id_candidate(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() && s.len() < MAX_ID_LEN => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
