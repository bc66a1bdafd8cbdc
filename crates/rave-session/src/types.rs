//! Shared session types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Idle, accepts a command
    Ready,
    /// A command is in flight
    Running,
    /// Interpreter process exited unexpectedly
    Crashed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// What a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// Long-lived interactive interpreter
    Interpreter,
    /// One-shot platform shell command
    Shell,
    /// One-shot interpreter script evaluation
    InterpreterScript,
}

/// Snapshot of a session for callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Caller-chosen id
    pub id: String,
    /// Kind
    pub kind: SessionKind,
    /// Status at snapshot time
    pub status: SessionStatus,
    /// Allocated port (interpreter sessions only)
    pub port: Option<u16>,
    /// Backing executable, if any
    pub executable: Option<PathBuf>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Result of one command
///
/// Timeouts are failures whose `error` names the timeout; partial output is
/// still delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Whether the command completed successfully
    pub success: bool,
    /// Captured stdout (sentinel stripped for interpreter sessions)
    pub output: String,
    /// Captured stderr
    pub stderr: String,
    /// Process exit code, when the process exited
    pub exit_code: Option<i32>,
    /// Failure description
    pub error: Option<String>,
    /// The command was skipped by a human (manual mode only)
    pub skipped: bool,
}

impl ExecOutcome {
    /// Successful outcome
    #[must_use]
    pub fn success(output: String, stderr: String, exit_code: Option<i32>) -> Self {
        Self {
            success: true,
            output,
            stderr,
            exit_code,
            ..Self::default()
        }
    }

    /// Failed outcome
    #[must_use]
    pub fn failure(error: impl Into<String>, output: String, stderr: String) -> Self {
        Self {
            success: false,
            output,
            stderr,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach the exit code
    #[must_use]
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }
}
