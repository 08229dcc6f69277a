//! Error types for pipeline execution
//!
//! Errors are classified by how the pipeline reacts to them:
//! - Retryable: transient completion failures (network, timeout, empty reply)
//! - Absorbed: malformed output that survived every repair layer, ambiguous
//!   classifications, rejected merges. The unit is flagged and the run continues.
//! - Fatal to the run: store and configuration failures at start-up

use thiserror::Error;

use crate::completion::CompletionError;
use crate::db::DbError;

/// Error types for pipeline execution
#[derive(Debug, Error)]
pub enum PipelineError {
    // Retryable errors
    #[error("Completion call failed after {attempts} attempt(s): {detail}")]
    TransientCallFailure { attempts: u32, detail: String },

    // Absorbed per unit
    #[error("Malformed completion output: {0}")]
    MalformedOutput(String),

    #[error("Record failed validation: {0}")]
    ValidationFailure(String),

    #[error("Classification ambiguous: {0}")]
    ClassificationAmbiguous(String),

    #[error("Merge rejected: {0}")]
    MergeConflict(String),

    // Fatal to the run
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Returns true if this error may clear up on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientCallFailure { .. })
    }

    /// Short, stable label used in log lines and failure summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientCallFailure { .. } => "transient_call_failure",
            PipelineError::MalformedOutput(_) => "malformed_output",
            PipelineError::ValidationFailure(_) => "validation_failure",
            PipelineError::ClassificationAmbiguous(_) => "classification_ambiguous",
            PipelineError::MergeConflict(_) => "merge_conflict",
            PipelineError::Store(_) => "store",
            PipelineError::Config(_) => "config",
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Store(DbError::Sqlite(err))
    }
}

impl From<CompletionError> for PipelineError {
    fn from(err: CompletionError) -> Self {
        if err.is_retryable() {
            PipelineError::TransientCallFailure {
                attempts: 1,
                detail: err.to_string(),
            }
        } else {
            PipelineError::Config(err.to_string())
        }
    }
}
