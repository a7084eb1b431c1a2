//! Execution capabilities.
//!
//! Concrete executors (file writes, document mutations, git, task agents)
//! live outside this workspace. They are reached through the traits below
//! and report failures as an [`ExecutionError`] carrying a closed
//! [`ErrorKind`], so callers can branch on the kind instead of parsing text.

use std::fmt;

use af_core::types::{FileAction, FirestoreAction, GitAction, Task};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing, expired, or rejected credentials.
    Authentication,
    Timeout,
    RateLimited,
    /// Connection-level failure reaching a dependency.
    Network,
    /// The action itself was malformed.
    InvalidInput,
    /// The target changed underneath us.
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Whatever the executor logged before failing.
    pub logs: Vec<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            logs: Vec::new(),
        }
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }
}

// ---------------------------------------------------------------------------
// Action execution
// ---------------------------------------------------------------------------

/// Output of one successfully executed action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub output: String,
    pub logs: Vec<String>,
}

impl ActionOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            logs: Vec::new(),
        }
    }
}

/// Executes one kind of action. There is one implementation per action kind.
#[async_trait]
pub trait ActionHandler<A: Send + Sync>: Send + Sync {
    async fn execute(&self, action: &A) -> Result<ActionOutput, ExecutionError>;
}

pub type FileHandler = dyn ActionHandler<FileAction>;
pub type FirestoreHandler = dyn ActionHandler<FirestoreAction>;
pub type GitHandler = dyn ActionHandler<GitAction>;

// ---------------------------------------------------------------------------
// Task execution
// ---------------------------------------------------------------------------

/// Runs a persisted task on the provider it was routed to.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        project_id: &str,
        task: &Task,
        provider: &str,
    ) -> Result<serde_json::Value, ExecutionError>;
}
