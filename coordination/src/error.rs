//! Coordination error types
//!
//! Structured errors for the deterministic side of the pipeline: artifact
//! writes, command validation and version control.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors raised by coordination building blocks
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Artifact path resolves outside the project root
    #[error("Path escape rejected: '{path}' resolves outside {root}")]
    PathEscape { path: String, root: PathBuf },

    /// Artifact path is empty or otherwise unusable
    #[error("Invalid artifact path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Command is not on the execution allow-list
    #[error("Command not allowed: {command}")]
    CommandNotAllowed { command: String },

    /// Command string failed validation before spawn
    #[error("Rejected command '{command}': {reason}")]
    CommandRejected { command: String, reason: String },

    /// Git operation failed
    #[error("Git error during {operation}: {message}")]
    Git { operation: String, message: String },

    /// IO error with path context
    #[error("IO error at {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl CoordinationError {
    /// Create a path escape error
    pub fn path_escape(path: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self::PathEscape {
            path: path.into(),
            root: root.into(),
        }
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an IO error with path context
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Security violations are terminal for the offending artifact or command
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::PathEscape { .. } | Self::CommandNotAllowed { .. } | Self::CommandRejected { .. }
        )
    }

    /// Check if error is retryable (transient failure)
    ///
    /// Git lock contention is transient; everything else needs a fix first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Git { message, .. } => {
                message.contains("index.lock") || message.contains("Unable to create")
            }
            _ => false,
        }
    }

    /// Machine-readable code for API and report payloads
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathEscape { .. } => "PATH_ESCAPE",
            Self::InvalidPath { .. } => "INVALID_PATH",
            Self::CommandNotAllowed { .. } => "COMMAND_NOT_ALLOWED",
            Self::CommandRejected { .. } => "COMMAND_REJECTED",
            Self::Git { .. } => "GIT_ERROR",
            Self::Io { .. } => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordinationError::path_escape("../outside.txt", "/work");
        assert_eq!(
            err.to_string(),
            "Path escape rejected: '../outside.txt' resolves outside /work"
        );

        let err = CoordinationError::CommandNotAllowed {
            command: "rm".into(),
        };
        assert_eq!(err.to_string(), "Command not allowed: rm");
    }

    #[test]
    fn test_security_classification() {
        assert!(CoordinationError::path_escape("/etc/passwd", "/work").is_security_violation());
        assert!(!CoordinationError::git("commit", "nothing to commit").is_security_violation());
    }

    #[test]
    fn test_retryable_git_lock() {
        let err = CoordinationError::git("add", "fatal: Unable to create '.git/index.lock'");
        assert!(err.is_retryable());
        assert!(!CoordinationError::git("commit", "nothing added").is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            CoordinationError::invalid_path("", "empty").code(),
            "INVALID_PATH"
        );
        assert_eq!(CoordinationError::git("x", "y").code(), "GIT_ERROR");
    }
}
