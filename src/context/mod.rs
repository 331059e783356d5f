//! Failure context extraction from raw build logs.

pub mod parser;

use serde::{Deserialize, Serialize};

pub use parser::{ContextBuilder, truncate_log};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// A generic error line pulled from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextError {
    pub message: String,
    pub severity: IssueSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub context_lines: Vec<String>,
}

/// A compiler-style diagnostic (`file:line:col: error: message`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildError {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub message: String,
    pub severity: IssueSeverity,
}

/// A failed test (pytest `FAILED` lines and friends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_file: Option<String>,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// An exception with its frames (Python tracebacks, JS stacks, Go panics,
/// Java exceptions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackTrace {
    pub exception_type: String,
    pub message: String,
    #[serde(default)]
    pub frames: Vec<StackFrame>,
}

/// Structured failure context for one pipeline event. This is the input
/// to RCA, the issue graph, and the adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureContextBundle {
    pub event_id: String,
    pub repo: String,
    pub commit_sha: String,
    pub branch: String,
    pub pipeline_id: String,
    pub job_name: String,
    #[serde(default)]
    pub errors: Vec<ContextError>,
    #[serde(default)]
    pub build_errors: Vec<BuildError>,
    #[serde(default)]
    pub test_failures: Vec<TestFailure>,
    #[serde(default)]
    pub stack_traces: Vec<StackTrace>,
    pub log_summary: String,
}

impl FailureContextBundle {
    /// The first significant error lines, in source order. Used for run
    /// key derivation and evidence summaries.
    pub fn significant_lines(&self, limit: usize) -> Vec<String> {
        let mut lines: Vec<(usize, String)> = Vec::new();
        for (i, err) in self.errors.iter().enumerate() {
            lines.push((i, err.message.clone()));
        }
        for (i, be) in self.build_errors.iter().enumerate() {
            lines.push((usize::MAX / 2 + i, format!("{}: {}", be.file, be.message)));
        }
        lines.sort_by_key(|(order, _)| *order);
        lines.into_iter().map(|(_, l)| l).take(limit).collect()
    }
}
