// ABOUTME: Core type definitions for sandboxed execution
// ABOUTME: Artifacts, execution requests, raw backend output and normalized results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A named, persisted piece of source code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeArtifact {
    pub name: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Incremented on every save, starting at 1
    pub version: i64,
}

/// Resource ceilings applied to one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes (must be > 0)
    pub memory_limit_bytes: u64,
    /// CPU cores (fractional allowed, e.g. 0.5)
    pub cpu_cores: Option<f64>,
    /// Maximum number of processes inside the sandbox
    pub pids_limit: Option<i64>,
}

impl ResourceLimits {
    pub fn with_memory(memory_limit_bytes: u64) -> Self {
        Self {
            memory_limit_bytes,
            cpu_cores: None,
            pids_limit: None,
        }
    }
}

/// One execution of one artifact. Immutable once built.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub artifact: CodeArtifact,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

impl ExecutionRequest {
    pub fn new(
        artifact: CodeArtifact,
        args: Vec<String>,
        timeout: Duration,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            artifact,
            args,
            timeout,
            limits,
        }
    }
}

/// How the sandboxed program stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The program exited on its own (cleanly or not)
    Exited,
    /// The wall-clock ceiling expired and the program was killed
    TimedOut,
    /// The caller cancelled and the program was killed
    Cancelled,
}

/// Unprocessed signal from one execution
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub exit_code: Option<i64>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// More stdout was produced than the backend kept
    pub stdout_overflowed: bool,
    /// More stderr was produced than the backend kept
    pub stderr_overflowed: bool,
    pub duration: Duration,
    pub termination: Termination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Crashed,
    RejectedInput,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Crashed => "crashed",
            Self::RejectedInput => "rejected_input",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of one execution, owned by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Record for input the broker refused before touching a sandbox
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::RejectedInput,
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: reason.into(),
            duration_ms: 0,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}
