use crate::ids::TaskId;

/// Shared error taxonomy for every store-access and negotiation operation.
///
/// `PreconditionFailed` is a business-rule rejection (task taken, wrong
/// status, worker offline) and is user-actionable; `Transport` is an
/// infrastructure failure and the only variant worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{operation} rejected for task {task_id}: {reason}")]
    PreconditionFailed {
        operation: &'static str,
        task_id: TaskId,
        reason: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("transport failure during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },
}

impl DispatchError {
    pub fn precondition(
        operation: &'static str,
        task_id: &TaskId,
        reason: impl Into<String>,
    ) -> Self {
        DispatchError::PreconditionFailed {
            operation,
            task_id: task_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DispatchError::Validation(message.into())
    }

    pub fn transport(operation: &'static str, message: impl Into<String>) -> Self {
        DispatchError::Transport {
            operation,
            message: message.into(),
        }
    }

    /// Whether a caller may blindly retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transport { .. })
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
