//! Typed error hierarchy for the orchestration core.
//!
//! Three enums cover the three subsystems:
//! - `GatewayError` — tenant-scoped storage gateway failures
//! - `DispatchError` — generation dispatch failures
//! - `ReconcileError` — webhook/poll reconciliation failures

use thiserror::Error;

/// Errors from the tenant-scoped data gateway.
///
/// Session-context failures are deliberately opaque: the caller learns that
/// the scoped transaction aborted, never which part of the context was
/// missing, so a bug here can't degrade into partial access.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to open storage transaction: {0}")]
    Transaction(#[source] rusqlite::Error),

    #[error("Failed to establish session context")]
    SessionContext,

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Errors from the generation dispatcher.
///
/// Transport failures are not represented here: a failed generator
/// invocation is recorded on the job (`failed` + descriptive progress text)
/// and the dispatch call still returns the job.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Idea {id} not found")]
    IdeaNotFound { id: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the reconciliation layer (webhook + polling paths).
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Callback payload does not name an idea")]
    MissingSubject,

    #[error("Callback payload does not name a document kind")]
    MissingKind,

    #[error("No document of kind {kind} found for idea {idea_id}")]
    NoMatchingDocument { idea_id: i64, kind: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_session_context_is_opaque() {
        let err = GatewayError::SessionContext;
        assert_eq!(err.to_string(), "Failed to establish session context");
    }

    #[test]
    fn dispatch_idea_not_found_carries_id() {
        let err = DispatchError::IdeaNotFound { id: 42 };
        assert!(err.to_string().contains("42"));
        match &err {
            DispatchError::IdeaNotFound { id } => assert_eq!(*id, 42),
            _ => panic!("Expected IdeaNotFound"),
        }
    }

    #[test]
    fn reconcile_no_matching_document_carries_context() {
        let err = ReconcileError::NoMatchingDocument {
            idea_id: 7,
            kind: "lean_canvas".to_string(),
        };
        assert!(err.to_string().contains("lean_canvas"));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GatewayError::SessionContext);
        assert_std_error(&DispatchError::IdeaNotFound { id: 1 });
        assert_std_error(&ReconcileError::MissingSubject);
    }

    #[test]
    fn reconcile_error_converts_from_anyhow() {
        let err: ReconcileError = anyhow::anyhow!("record fetch failed").into();
        assert!(matches!(err, ReconcileError::Other(_)));
        assert!(err.to_string().contains("record fetch failed"));
    }
}
