//! Error taxonomy for the engine.
//!
//! Callers are expected to match on these variants: source-level extraction
//! failures are recoverable by retry, retrieval unavailability is call-level,
//! and stage failures move the owning run into its `error` state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// An id (run, source, chunk, document) did not resolve.
    #[error("not found: {0}")]
    NotFound(String),

    /// Source-level extraction failure. Recorded on the source, retryable in
    /// isolation, never aborts the run on its own.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Both retrieval sub-searches failed for a hybrid call.
    #[error("retrieval unavailable: vector and keyword search both failed")]
    RetrievalUnavailable,

    /// Versioning contract violated: missing change log for version > 1, or
    /// version-assignment conflicts exhausted their retry budget.
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// Pipeline-level stage failure; transitions the run to `error`.
    #[error("stage '{stage}' failed: {cause}")]
    StageFailed { stage: String, cause: String },

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn stage_failed(stage: impl Into<String>, cause: impl Into<String>) -> Self {
        EngineError::StageFailed {
            stage: stage.into(),
            cause: cause.into(),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
