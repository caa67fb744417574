//! Error taxonomy for the ingestion core.
//!
//! Every user-visible error carries a stable machine code. The closed set:
//! `RATE_LIMIT_EXCEEDED`, `UNSUPPORTED_KIND`, `KIND_MISMATCH`,
//! `PARSE_TIMEOUT`, `PARSE_FAILED`, `PROCESSING_FAILED`, `CANCELLED`,
//! `ATTEMPTS_EXHAUSTED`, `WEBHOOK_DELIVERY_EXHAUSTED`, `STORE_ERROR`,
//! `INVALID_ARGUMENT`, `NOT_FOUND`, `CONFIG_ERROR`, `STORAGE_ERROR`.
//! New codes are additive; existing codes never change meaning.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::FileKind;

/// Machine codes for the error surface.
pub mod code {
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const UNSUPPORTED_KIND: &str = "UNSUPPORTED_KIND";
    pub const KIND_MISMATCH: &str = "KIND_MISMATCH";
    pub const PARSE_TIMEOUT: &str = "PARSE_TIMEOUT";
    pub const PARSE_FAILED: &str = "PARSE_FAILED";
    pub const PROCESSING_FAILED: &str = "PROCESSING_FAILED";
    pub const CANCELLED: &str = "CANCELLED";
    pub const ATTEMPTS_EXHAUSTED: &str = "ATTEMPTS_EXHAUSTED";
    pub const WEBHOOK_DELIVERY_EXHAUSTED: &str = "WEBHOOK_DELIVERY_EXHAUSTED";
    pub const STORE_ERROR: &str = "STORE_ERROR";
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] crate::ratelimit::RateLimitError),
}

impl IngestError {
    /// Stable machine code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Config(_) => code::CONFIG_ERROR,
            IngestError::Parse(e) => e.code(),
            IngestError::Pipeline(e) => e.code(),
            IngestError::Store(e) => e.code(),
            IngestError::Storage(_) => code::STORAGE_ERROR,
            IngestError::Worker(_) => code::PROCESSING_FAILED,
            IngestError::Webhook(e) => e.code(),
            IngestError::RateLimit(_) => code::RATE_LIMIT_EXCEEDED,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unsupported document kind: {0}")]
    Unsupported(String),

    #[error("Failed to read blob: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed {kind} document: {message}")]
    Malformed { kind: FileKind, message: String },

    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("Parser timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl ParseError {
    /// Whether the pipeline may retry the job after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ParseError::Io(_) | ParseError::Timeout { .. } | ParseError::Ocr(_) => true,
            ParseError::Unsupported(_) | ParseError::Malformed { .. } => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ParseError::Unsupported(_) => code::UNSUPPORTED_KIND,
            ParseError::Timeout { .. } => code::PARSE_TIMEOUT,
            _ => code::PARSE_FAILED,
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write blob '{path}': {source}")]
    WriteBlob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read blob '{path}': {source}")]
    ReadBlob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker pool is shut down")]
    ShutDown,

    #[error("Worker task failed: {0}")]
    TaskFailed(String),

    #[error("Shutdown timed out after {seconds}s")]
    ShutdownTimeout { seconds: u64 },
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Delivery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint returned status {0}")]
    Status(u16),

    #[error("Delivery timed out")]
    Timeout,

    #[error("Delivery attempts exhausted after {attempts}")]
    Exhausted { attempts: u32 },

    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    #[error("Signature mismatch")]
    SignatureMismatch,
}

impl WebhookError {
    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::Exhausted { .. } => code::WEBHOOK_DELIVERY_EXHAUSTED,
            WebhookError::InvalidUrl(_) | WebhookError::SignatureMismatch => {
                code::INVALID_ARGUMENT
            }
            _ => code::PROCESSING_FAILED,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_retryability() {
        assert!(ParseError::Timeout { seconds: 300 }.is_retryable());
        assert!(ParseError::Ocr("engine crashed".to_string()).is_retryable());
        assert!(!ParseError::Unsupported("exe".to_string()).is_retryable());
        assert!(!ParseError::Malformed {
            kind: FileKind::Pdf,
            message: "bad xref".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_parse_error_codes() {
        assert_eq!(
            ParseError::Unsupported("exe".to_string()).code(),
            code::UNSUPPORTED_KIND
        );
        assert_eq!(
            ParseError::Timeout { seconds: 1 }.code(),
            code::PARSE_TIMEOUT
        );
    }

    #[test]
    fn test_webhook_error_codes() {
        assert_eq!(
            WebhookError::Exhausted { attempts: 5 }.code(),
            code::WEBHOOK_DELIVERY_EXHAUSTED
        );
    }
}
