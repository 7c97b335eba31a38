//! # Pipeline Errors
//!
//! Error taxonomy for the completion pipeline.
//!
//! Validation and state errors are returned synchronously to the caller that
//! caused them. Processing failures (a reporter rejecting a batch) and
//! monitoring failures never surface through this type across component
//! boundaries; they are contained by the component and exposed through
//! metrics and health status instead.

use thiserror::Error;

/// Errors returned by queue, batching, dispatch and configuration operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// An argument was missing or malformed (empty id, non-finite timing value, inverted window).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation is not allowed in the component's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No batch with the given id is known to the batching service.
    #[error("batch not found: {0}")]
    BatchNotFound(String),

    /// The queue stayed at capacity for the whole publish timeout.
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The cancellation signal fired while the operation was waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// Construction-time configuration problems, all of them at once.
    #[error("invalid configuration: {}", .0.join("; "))]
    Configuration(Vec<String>),
}

/// Result alias used across the library.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether this error belongs to the caller-programming-error class
    /// (validation or lifecycle state) rather than a runtime condition.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_)
                | PipelineError::InvalidState(_)
                | PipelineError::Configuration(_)
        )
    }
}
