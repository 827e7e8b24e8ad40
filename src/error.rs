//! Crate-wide error types for the admission engine.
//!
//! Each subsystem defines its own narrow error enum (see
//! [`crate::event::comment::CommentParseError`],
//! [`crate::resolver::ResolverError`], [`crate::concurrency::ConcurrencyError`]);
//! this module composes them into a single [`AdmissionError`] for callers that
//! want one error type at the crate boundary, while keeping each subsystem's
//! own enum available for callers that want to match more precisely.

use thiserror::Error;

use crate::concurrency::ConcurrencyError;
use crate::event::comment::CommentParseError;
use crate::resolver::ResolverError;

/// Errors surfaced across the admission pipeline.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// A comment or webhook payload could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),

    /// A requested remote resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Admission was denied because the repository is at its concurrency
    /// limit. Not fatal — callers are expected to queue and retry.
    #[error("concurrency limit reached for {repository_key}")]
    ConcurrencyLimitReached {
        /// The repository key that is at capacity.
        repository_key: String,
    },

    /// An unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<CommentParseError> for AdmissionError {
    fn from(error: CommentParseError) -> Self {
        Self::Parse(error.to_string())
    }
}

impl From<ResolverError> for AdmissionError {
    fn from(error: ResolverError) -> Self {
        match error {
            ResolverError::NotFound { message } => Self::NotFound(message),
            ResolverError::Cancelled => Self::Cancelled,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ConcurrencyError> for AdmissionError {
    fn from(error: ConcurrencyError) -> Self {
        match error {
            ConcurrencyError::LimitReached { repository_key } => {
                Self::ConcurrencyLimitReached { repository_key }
            }
            ConcurrencyError::Cancelled => Self::Cancelled,
        }
    }
}
