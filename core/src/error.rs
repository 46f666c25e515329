use std::error::Error as _;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccrualError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Held record '{record_id}' not found")]
    RecordNotFound { record_id: String },

    #[error("Checkpoint of held record '{record_id}' changed during recomputation")]
    StaleCheckpoint { record_id: String },

    #[error("Background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AccrualError {
    /// Render this error and its `source()` chain, outermost first.
    pub fn trace(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }
        chain
    }
}

pub type AccrualResult<T> = Result<T, AccrualError>;
