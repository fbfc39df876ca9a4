// Error taxonomy for the pipeline
//
// Every failure that leaves a component is one of the closed variants of
// PipelineError. Stage failures are folded into PairState by the orchestrator;
// configuration and validation errors go straight back to the caller.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Number of stderr lines kept on a tool failure.
pub const STDERR_TAIL_LINES: usize = 20;

/// Coarse classification of a failure, stable enough to show to users and to
/// assert on in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Validation,
    MissingInput,
    Comparison,
    ToolFailure,
    Timeout,
    MissingOutput,
    Io,
    Archive,
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Validation => "validation",
            ErrorCategory::MissingInput => "missing input",
            ErrorCategory::Comparison => "comparison",
            ErrorCategory::ToolFailure => "tool failure",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::MissingOutput => "missing output",
            ErrorCategory::Io => "i/o",
            ErrorCategory::Archive => "archive",
            ErrorCategory::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three stages a pair goes through, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Comparison,
    DiffDetail,
    ColorApplication,
}

impl StageKind {
    /// Name of the external collaborator behind the stage.
    pub fn tool_name(&self) -> &'static str {
        match self {
            StageKind::Comparison => "compare_labels_multi",
            StageKind::DiffDetail => "diff_label_processor",
            StageKind::ColorApplication => "dxf_processor",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool_name())
    }
}

/// How an external tool invocation ended when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolExit {
    /// Process exited with a non-zero code
    Code(i32),
    /// Process was terminated by a signal
    Signal,
    /// Process exceeded the configured timeout and was killed
    Timeout(Duration),
    /// Process could not be started at all
    SpawnFailed,
    /// Process exited 0 but the expected output file is not there
    MissingOutput,
    /// Parameters failed schema validation; nothing was launched
    InvalidArguments,
}

impl fmt::Display for ToolExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolExit::Code(code) => write!(f, "exit code {}", code),
            ToolExit::Signal => f.write_str("killed by signal"),
            ToolExit::Timeout(_) => f.write_str("timeout"),
            ToolExit::SpawnFailed => f.write_str("spawn failed"),
            ToolExit::MissingOutput => f.write_str("missing output"),
            ToolExit::InvalidArguments => f.write_str("invalid arguments"),
        }
    }
}

/// Context carried by a failed subprocess stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub pair_name: String,
    pub stage: StageKind,
    pub exit: ToolExit,
    pub message: String,
    pub stderr_tail: String,
}

impl ToolFailure {
    pub fn new(
        pair_name: impl Into<String>,
        stage: StageKind,
        exit: ToolExit,
        message: impl Into<String>,
    ) -> Self {
        Self {
            pair_name: pair_name.into(),
            stage,
            exit,
            message: message.into(),
            stderr_tail: String::new(),
        }
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr_tail = stderr_tail(stderr, STDERR_TAIL_LINES);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        match self.exit {
            ToolExit::Timeout(_) => ErrorCategory::Timeout,
            ToolExit::MissingOutput => ErrorCategory::MissingOutput,
            ToolExit::InvalidArguments => ErrorCategory::Validation,
            ToolExit::Code(_) | ToolExit::Signal | ToolExit::SpawnFailed => {
                ErrorCategory::ToolFailure
            }
        }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} failed ({}): {}",
            self.pair_name, self.stage, self.exit, self.message
        )
    }
}

/// Every failure the pipeline can report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("validation error{}: {message}", pair_prefix(.pair_name))]
    Validation {
        pair_name: Option<String>,
        message: String,
    },

    #[error("[{pair_name}] label comparison failed ({category}): {message}")]
    Comparison {
        pair_name: String,
        category: ErrorCategory,
        message: String,
    },

    #[error("{0}")]
    DiffProcessor(ToolFailure),

    #[error("{0}")]
    DxfProcessor(ToolFailure),

    #[error("archive error{}: {message}", pair_prefix(.pair_name))]
    Archive {
        pair_name: Option<String>,
        message: String,
    },

    #[error("[{pair_name}] run cancelled at {stage}")]
    Cancelled { pair_name: String, stage: StageKind },
}

fn pair_prefix(pair_name: &Option<String>) -> String {
    pair_name
        .as_ref()
        .map(|name| format!(" for pair {}", name))
        .unwrap_or_default()
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            message: message.into(),
        }
    }

    pub fn validation(pair_name: Option<&str>, message: impl Into<String>) -> Self {
        PipelineError::Validation {
            pair_name: pair_name.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn comparison(
        pair_name: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        PipelineError::Comparison {
            pair_name: pair_name.into(),
            category,
            message: message.into(),
        }
    }

    pub fn archive(pair_name: Option<&str>, message: impl Into<String>) -> Self {
        PipelineError::Archive {
            pair_name: pair_name.map(str::to_string),
            message: message.into(),
        }
    }

    /// Wrap a tool failure in the variant that belongs to its stage.
    pub fn from_tool(failure: ToolFailure) -> Self {
        match failure.stage {
            StageKind::ColorApplication => PipelineError::DxfProcessor(failure),
            StageKind::DiffDetail => PipelineError::DiffProcessor(failure),
            StageKind::Comparison => PipelineError::Comparison {
                category: failure.category(),
                message: failure.to_string(),
                pair_name: failure.pair_name,
            },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Configuration { .. } => ErrorCategory::Configuration,
            PipelineError::Validation { .. } => ErrorCategory::Validation,
            PipelineError::Comparison { category, .. } => *category,
            PipelineError::DiffProcessor(f) | PipelineError::DxfProcessor(f) => f.category(),
            PipelineError::Archive { .. } => ErrorCategory::Archive,
            PipelineError::Cancelled { .. } => ErrorCategory::Cancelled,
        }
    }

    pub fn pair_name(&self) -> Option<&str> {
        match self {
            PipelineError::Configuration { .. } => None,
            PipelineError::Validation { pair_name, .. }
            | PipelineError::Archive { pair_name, .. } => pair_name.as_deref(),
            PipelineError::Comparison { pair_name, .. }
            | PipelineError::Cancelled { pair_name, .. } => Some(pair_name),
            PipelineError::DiffProcessor(f) | PipelineError::DxfProcessor(f) => Some(&f.pair_name),
        }
    }

    pub fn stage(&self) -> Option<StageKind> {
        match self {
            PipelineError::Comparison { .. } => Some(StageKind::Comparison),
            PipelineError::DiffProcessor(f) | PipelineError::DxfProcessor(f) => Some(f.stage),
            PipelineError::Cancelled { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Captured stderr tail, empty for errors that never ran a process.
    pub fn stderr(&self) -> &str {
        match self {
            PipelineError::DiffProcessor(f) | PipelineError::DxfProcessor(f) => &f.stderr_tail,
            _ => "",
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }
}

/// Keep the last `max_lines` lines of a captured stream.
pub fn stderr_tail(stderr: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
