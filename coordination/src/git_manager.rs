//! Git commit manager for the project root.
//!
//! Commits are the last irreversible step of a run. Failures are reported to
//! the caller and never undo files already written.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{CoordinationError, CoordinationResult};

/// Default number of retry attempts for transient failures
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Something that can record the current project state.
pub trait Committer: Send + Sync {
    /// Stage everything and commit with `message`. Returns a short
    /// description of the result (the new commit hash on success).
    fn commit(&self, message: &str) -> CoordinationResult<String>;
}

/// Git-backed [`Committer`].
pub struct GitManager {
    working_dir: PathBuf,
    max_retries: u32,
}

impl GitManager {
    /// Create manager for working directory
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Create manager with custom retry settings
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Run git command and return trimmed stdout
    fn run_git(&self, args: &[&str]) -> CoordinationResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| CoordinationError::git("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(CoordinationError::git(args.join(" "), message));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git command with automatic retry for transient failures
    ///
    /// Uses exponential backoff: 100ms, 200ms, 400ms, etc.
    fn run_git_with_retry(&self, args: &[&str]) -> CoordinationResult<String> {
        let mut attempt = 0;
        loop {
            match self.run_git(args) {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    tracing::debug!(attempt, delay_ms = delay, error = %e, "Retrying git command");
                    std::thread::sleep(std::time::Duration::from_millis(delay));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether the working directory is inside a git repository
    pub fn is_repository(&self) -> bool {
        self.run_git(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out == "true")
            .unwrap_or(false)
    }

    /// Initialize a repository if none exists
    pub fn ensure_repository(&self) -> CoordinationResult<()> {
        if !self.is_repository() {
            self.run_git(&["init"])?;
            tracing::info!(dir = %self.working_dir.display(), "Initialized git repository");
        }
        Ok(())
    }

    /// Get current commit hash (short)
    pub fn current_commit(&self) -> CoordinationResult<String> {
        self.run_git(&["rev-parse", "--short", "HEAD"])
    }

    /// Check if working directory has uncommitted changes
    pub fn has_uncommitted_changes(&self) -> CoordinationResult<bool> {
        let status = self.run_git(&["status", "--porcelain"])?;
        Ok(!status.is_empty())
    }
}

impl Committer for GitManager {
    fn commit(&self, message: &str) -> CoordinationResult<String> {
        self.run_git_with_retry(&["add", "."])?;
        self.run_git_with_retry(&["commit", "-m", message])?;
        let hash = self.current_commit()?;
        tracing::info!(commit = %hash, subject = message, "Committed changes");
        Ok(hash)
    }
}
