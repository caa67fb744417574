use thiserror::Error;

use crate::error::code;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job {id} is already terminal ({state})")]
    AlreadyTerminal { id: String, state: String },

    #[error("Invalid transition for job {id}: {event} from state {from}")]
    InvalidTransition {
        id: String,
        from: String,
        event: String,
    },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => code::NOT_FOUND,
            StoreError::AlreadyTerminal { .. } | StoreError::InvalidTransition { .. } => {
                code::INVALID_ARGUMENT
            }
            _ => code::STORE_ERROR,
        }
    }
}
