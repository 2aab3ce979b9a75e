//! Run-level error taxonomy.
//!
//! Every stage fails fast; the first failure ends the run and is reported
//! once through [`crate::job::JobOutcome`]. [`ErrorClass`] is the coarse
//! classification the orchestration side sees.

use serde::Serialize;
use thiserror::Error;

use crate::merge::MergeError;
use crate::options::OptionsError;
use crate::retrieve::RetrievalError;
use crate::store::{ArchiveStoreError, EncryptionConflict};

/// Coarse failure classification reported with a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed merge options; nothing was fetched.
    Config,
    /// No output location declared; nothing was fetched.
    ConfigurationMissing,
    Retrieval,
    Merge,
    Store,
    Internal,
}

impl ErrorClass {
    /// Process exit code for a run that failed with this class.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Internal => 1,
            Self::Config => 2,
            Self::ConfigurationMissing => 3,
            Self::Retrieval => 4,
            Self::Merge => 5,
            Self::Store => 6,
        }
    }

    /// Human-readable failure message reported to the orchestrator.
    pub fn failure_message(self) -> &'static str {
        match self {
            Self::Config => "Invalid JSON input error",
            Self::ConfigurationMissing => "No output artifact configured.",
            Self::Retrieval => "Failed to retrieve an input artifact.",
            Self::Merge => "Failed to load zipped artifact.",
            Self::Store => "Failed to upload output artifact.",
            Self::Internal => "Unknown error: check logs.",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid merge options: {0}")]
    Config(#[from] OptionsError),

    /// The job description itself could not be read.
    #[error("invalid job description: {message}")]
    InvalidJob { message: String },

    #[error("no output artifact configured")]
    ConfigurationMissing,

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    EncryptionConflict(#[from] EncryptionConflict),

    #[error(transparent)]
    Store(#[from] ArchiveStoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) | Self::InvalidJob { .. } => ErrorClass::Config,
            Self::ConfigurationMissing => ErrorClass::ConfigurationMissing,
            Self::Retrieval(_) => ErrorClass::Retrieval,
            Self::Merge(_) => ErrorClass::Merge,
            // The upload is the step that cannot honor conflicting settings.
            Self::EncryptionConflict(_) | Self::Store(_) => ErrorClass::Store,
            Self::Internal(_) => ErrorClass::Internal,
        }
    }
}
