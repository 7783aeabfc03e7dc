//! Error types and reporting for worker loops.

use thiserror::Error;

/// Errors returned from a single worker processing step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The item is dropped and the loop continues.
    #[error("Recoverable error: {0}")]
    Recoverable(String),
    /// The worker stops after reporting.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl WorkerError {
    pub fn recoverable(err: impl std::fmt::Display) -> Self {
        WorkerError::Recoverable(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        WorkerError::Fatal(err.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Fatal(_))
    }
}

impl From<crate::error::VoxlineError> for WorkerError {
    fn from(err: crate::error::VoxlineError) -> Self {
        WorkerError::Recoverable(err.to_string())
    }
}

/// Trait for reporting worker errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a worker.
    fn report(&self, worker: &str, error: &WorkerError);
}

/// Reporter that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, worker: &str, error: &WorkerError) {
        match error {
            WorkerError::Recoverable(msg) => {
                tracing::warn!(worker, error = %msg, "worker item failed");
            }
            WorkerError::Fatal(msg) => {
                tracing::error!(worker, error = %msg, "worker stopped");
            }
        }
    }
}
