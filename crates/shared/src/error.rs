use thiserror::Error;

use crate::domain::{FieldId, TaskState};

/// Operation attempted in the wrong lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidStateError {
    /// The operation requires one specific state.
    #[error("task is {actual:?}, expected {expected:?}")]
    Unexpected {
        expected: TaskState,
        actual: TaskState,
    },
    /// The operation requires a non-terminal state, but the task
    /// already reached its terminal.
    #[error("task already reached terminal state {actual:?}")]
    AlreadyTerminal { actual: TaskState },
}

/// Terminal error of a task result. Cloneable so the stored terminal
/// can be replayed to every subscriber; the work body's error is
/// carried as opaque pass-through text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskFailure {
    #[error("task cancelled before completion")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl From<anyhow::Error> for TaskFailure {
    fn from(error: anyhow::Error) -> Self {
        TaskFailure::Failed(format!("{error:#}"))
    }
}

/// Edit event addressed to a field the controller does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown form field {field_id}")]
pub struct UnknownFieldError {
    pub field_id: FieldId,
}

impl UnknownFieldError {
    pub fn new(field_id: FieldId) -> Self {
        Self { field_id }
    }
}
