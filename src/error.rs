//! Error types for jobq.

use thiserror::Error;

use crate::model::{JobId, State};

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue is closed: {0}")]
    QueueClosed(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("handler failed on attempt {attempt}: {message}")]
    Handler { attempt: u32, message: String },

    #[error("attempt {attempt} exceeded its deadline")]
    Timeout { attempt: u32 },

    #[error("job was cancelled")]
    Cancelled,

    #[error("exhausted {attempts} attempts: {last_error}")]
    MaxAttemptsExceeded { attempts: u32, last_error: String },

    #[error("no processor registered for job name {0:?}")]
    MissingProcessor(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
