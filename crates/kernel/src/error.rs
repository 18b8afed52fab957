//! Kernel errors

use thiserror::Error;

use crate::types::Priority;

/// Kernel result type
pub type Result<T> = std::result::Result<T, Error>;

/// Kernel errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("step {step} carries barrier id {barrier_id} but {priority:?} is not a join priority")]
    BarrierPriority {
        step: usize,
        barrier_id: u64,
        priority: Priority,
    },

    #[error("compute step failed: {0}")]
    StepFailed(#[from] StepFailure),
}

/// Failure raised by a fallible compute body.
///
/// Marks the activation's local frame failed; the node aborts and its
/// successors are not scheduled, but the surrounding drain continues.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepFailure {
    message: String,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for StepFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for StepFailure {
    fn from(message: String) -> Self {
        Self { message }
    }
}
