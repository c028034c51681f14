//! Error types shared across the memory engine.
//!
//! Every fallible public API in this crate returns [`MemoryError`]. The
//! variants map one-to-one onto the failure contracts of the pipeline:
//! document validation, store access, provider transport, model output
//! parsing, and job scheduling. Transient provider failures are the only
//! kind the orchestrator retries; everything else is either fatal to the
//! enclosing batch or recorded and skipped.

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Unified error type for the memory engine.
#[derive(Debug, Error, Diagnostic)]
pub enum MemoryError {
    /// A document failed its construction invariants and never enters the
    /// pipeline.
    #[error("invalid document: {reason}")]
    #[diagnostic(
        code(memloom::document::invalid),
        help("Check the construction invariants: non-empty user, user listed in people, non-empty people, known message speakers.")
    )]
    InvalidDocument { reason: String },

    /// A vector's dimension does not match the store's configured dimension.
    ///
    /// This is a programming error and aborts the batch containing it.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(memloom::store::invalid_vector),
        help("Every vector written to the store must match the dimension fixed at store initialisation.")
    )]
    InvalidVector { expected: usize, actual: usize },

    /// The requested record does not exist.
    ///
    /// `Delete` treats this as success; `Get` and `Update` surface it.
    #[error("record not found: {id}")]
    #[diagnostic(code(memloom::store::not_found))]
    NotFound { id: String },

    /// The vector store backend failed. Fatal to the enclosing ingestion
    /// batch.
    #[error("store unavailable: {message}")]
    #[diagnostic(code(memloom::store::unavailable))]
    StoreUnavailable { message: String },

    /// The embedding provider failed transiently.
    #[error("embedder unavailable: {message}")]
    #[diagnostic(
        code(memloom::providers::embedder_unavailable),
        help("Transient; the orchestrator retries with exponential backoff before failing the job.")
    )]
    EmbedderUnavailable { message: String },

    /// The completion provider failed transiently.
    #[error("completer unavailable: {message}")]
    #[diagnostic(
        code(memloom::providers::completer_unavailable),
        help("Transient; the orchestrator retries with exponential backoff before failing the job.")
    )]
    CompleterUnavailable { message: String },

    /// Input rejected by a provider (empty text, oversized payload).
    #[error("invalid provider input: {message}")]
    #[diagnostic(code(memloom::providers::invalid_input))]
    InvalidInput { message: String },

    /// The completion model returned output the engine cannot interpret.
    ///
    /// Non-retryable at the job level: extraction treats it as an empty fact
    /// list, reconciliation falls back to the default ADD.
    #[error("malformed model output: {detail}")]
    #[diagnostic(code(memloom::providers::malformed_output))]
    MalformedModelOutput { detail: String },

    /// A worker job exceeded its configured deadline.
    #[error("job deadline exceeded after {timeout:?}")]
    #[diagnostic(code(memloom::workers::deadline))]
    DeadlineExceeded { timeout: Duration },

    /// The enclosing cancellation scope was cancelled while the job was
    /// queued or in flight.
    #[error("operation cancelled")]
    #[diagnostic(code(memloom::workers::cancelled))]
    Cancelled,

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(memloom::serde_json))]
    Serde(#[from] serde_json::Error),
}

impl MemoryError {
    /// Shorthand for wrapping a backend failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        MemoryError::StoreUnavailable {
            message: err.to_string(),
        }
    }

    /// Shorthand for a document invariant violation.
    pub fn invalid_document(reason: impl Into<String>) -> Self {
        MemoryError::InvalidDocument {
            reason: reason.into(),
        }
    }

    /// Shorthand for unparseable model output.
    pub fn malformed(detail: impl Into<String>) -> Self {
        MemoryError::MalformedModelOutput {
            detail: detail.into(),
        }
    }

    /// Whether the orchestrator should retry the failed operation.
    ///
    /// Only provider transport failures qualify; every other kind is either
    /// deterministic or already terminal for the job.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MemoryError::EmbedderUnavailable { .. } | MemoryError::CompleterUnavailable { .. }
        )
    }

    /// Whether the error aborts the whole ingestion batch rather than a
    /// single job.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, MemoryError::StoreUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(
            MemoryError::EmbedderUnavailable {
                message: "503".into()
            }
            .is_transient()
        );
        assert!(
            MemoryError::CompleterUnavailable {
                message: "timeout".into()
            }
            .is_transient()
        );
        assert!(!MemoryError::Cancelled.is_transient());
        assert!(
            !MemoryError::NotFound { id: "x".into() }.is_transient(),
            "missing records are deterministic"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(
            MemoryError::StoreUnavailable {
                message: "io".into()
            }
            .is_fatal()
        );
        assert!(!MemoryError::malformed("nonsense").is_fatal());
    }
}
