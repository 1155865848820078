//! Error taxonomy shared by every operation.
//!
//! Each failure path produces exactly one [`OpError`] kind. The kind string and
//! numeric code are part of the response envelope and must stay stable.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::exit_codes;

/// Process-level fault: `git` never produced a result we can classify.
#[derive(Debug, Error)]
pub enum ExecutionFailure {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("lost track of `{command}`: {message}")]
    Wait { command: String, message: String },
}

/// Failure of a dispatched operation.
#[derive(Debug, Error)]
pub enum OpError {
    /// Arguments rejected before any process ran.
    #[error("invalid arguments: {0}")]
    Validation(String),

    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    #[error("approval denied for `{operation}`")]
    ApprovalDenied { operation: String },

    /// Overlapping workflow or pending approval on the same repository.
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    /// `git` reported failure, or the step was refused before running it
    /// (`exit_code` is then `None`, as for a signal). The envelope carries the
    /// repository status observed afterwards.
    #[error(
        "`git {command}` failed ({}): {detail}",
        .exit_code.map_or_else(|| "no exit status".to_string(), |c| format!("exit {c}"))
    )]
    OperationFailed {
        command: String,
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("inspection failed: {0}")]
    Inspection(String),
}

impl OpError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn state_conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    pub fn inspection(msg: impl Into<String>) -> Self {
        Self::Inspection(msg.into())
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::ApprovalDenied { .. } => "approval_denied",
            Self::StateConflict(_) => "state_conflict",
            Self::Execution(_) => "execution_failure",
            Self::OperationFailed { .. } => "operation_failed",
            Self::Inspection(_) => "inspection_failure",
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Validation(_) => exit_codes::VALIDATION_ERROR,
            Self::UnknownOperation(_) => exit_codes::UNKNOWN_OPERATION,
            Self::ApprovalDenied { .. } => exit_codes::APPROVAL_DENIED,
            Self::StateConflict(_) => exit_codes::STATE_CONFLICT,
            Self::Execution(_) => exit_codes::EXECUTION_FAILURE,
            Self::OperationFailed { .. } => exit_codes::OPERATION_FAILED,
            Self::Inspection(_) => exit_codes::INSPECTION_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_codes_are_one_to_one() {
        let errors = [
            OpError::validation("x"),
            OpError::UnknownOperation("x".to_string()),
            OpError::ApprovalDenied {
                operation: "push".to_string(),
            },
            OpError::state_conflict("x"),
            OpError::Execution(ExecutionFailure::TimedOut {
                command: "git fetch".to_string(),
                timeout: Duration::from_secs(1),
            }),
            OpError::OperationFailed {
                command: "merge".to_string(),
                exit_code: Some(1),
                detail: String::new(),
            },
            OpError::inspection("x"),
        ];
        let mut kinds: Vec<&str> = errors.iter().map(OpError::kind).collect();
        let mut codes: Vec<i32> = errors.iter().map(OpError::code).collect();
        kinds.sort_unstable();
        kinds.dedup();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(kinds.len(), errors.len());
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn operation_failed_message_without_exit_status() {
        let err = OpError::OperationFailed {
            command: "rebase main".to_string(),
            exit_code: None,
            detail: "killed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "`git rebase main` failed (no exit status): killed"
        );
    }
}
