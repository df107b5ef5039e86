use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication failed for account {0}")]
    Unauthenticated(String),

    #[error("Insufficient credits: need {needed}, have {available}")]
    InsufficientCredits { needed: f64, available: f64 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Worker session not found: {0}")]
    WorkerNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Illegal job transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Worker lost while holding job {0}")]
    WorkerLost(String),

    #[error("Job {0} exceeded its wall-clock timeout")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GridError>;
