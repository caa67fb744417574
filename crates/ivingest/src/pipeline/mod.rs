//! The staged extraction pipeline: identify, parse, field-extract, persist.

mod runner;

use thiserror::Error;

use crate::error::{code, ParseError, StorageError};
use crate::model::FileKind;
use crate::store::StoreError;

pub use runner::{NoopProgress, Pipeline, PipelineOutcome, ProgressReporter};

/// Ordered pipeline stages with the progress percent each one reports at
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Identify,
    Parse,
    FieldExtract,
    Persist,
}

impl Stage {
    pub fn percent(&self) -> u8 {
        match self {
            Stage::Identify => 5,
            Stage::Parse => 30,
            Stage::FieldExtract => 70,
            Stage::Persist => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Identify => "identify",
            Stage::Parse => "parse",
            Stage::FieldExtract => "field_extract",
            Stage::Persist => "persist",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Declared kind {declared} does not match content ({found})")]
    KindMismatch { declared: FileKind, found: String },

    #[error("Parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("Blob access failed: {0}")]
    Blob(#[from] StorageError),

    #[error("Persist failed: {0}")]
    Persist(#[from] StoreError),

    #[error("Stage {stage} timed out after {seconds}s")]
    StageTimeout { stage: Stage, seconds: u64 },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Internal pipeline failure: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the worker may retry the job after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::KindMismatch { .. } | PipelineError::Cancelled => false,
            PipelineError::Parse(e) => e.is_retryable(),
            PipelineError::Blob(_)
            | PipelineError::Persist(_)
            | PipelineError::StageTimeout { .. }
            | PipelineError::Internal(_) => true,
        }
    }

    /// Stable machine code for the job's error payload.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::KindMismatch { .. } => code::KIND_MISMATCH,
            PipelineError::Parse(e) => e.code(),
            PipelineError::StageTimeout {
                stage: Stage::Parse,
                ..
            } => code::PARSE_TIMEOUT,
            PipelineError::Cancelled => code::CANCELLED,
            _ => code::PROCESSING_FAILED,
        }
    }
}
