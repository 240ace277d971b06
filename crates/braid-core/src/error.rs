use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BraidError {
    // LLM errors
    #[error("LLM request failed (transient): {0}")]
    LlmTransient(String),

    #[error("LLM request failed: {0}")]
    LlmFatal(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    #[error("Tool failed fatally: {tool}: {message}")]
    ToolFatal { tool: String, message: String },

    // State errors
    #[error("Delta based on version {expected} but state is at version {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("Invalid compaction: {0}")]
    InvalidDelta(String),

    // Graph errors
    #[error("Graph config error: {0}")]
    GraphConfig(String),

    // Run errors
    #[error("Run exceeded max steps ({0})")]
    StepLimitExceeded(usize),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Node '{node}' timed out after {secs}s")]
    Timeout { node: String, secs: u64 },

    // Session errors
    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification carried by `run-failed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conflict,
    GraphConfig,
    SessionBusy,
    StepLimitExceeded,
    Cancelled,
    Timeout,
    Transient,
    Fatal,
    Recoverable,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Conflict => "conflict",
            Self::GraphConfig => "graph_config",
            Self::SessionBusy => "session_busy",
            Self::StepLimitExceeded => "step_limit_exceeded",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Recoverable => "recoverable",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl BraidError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LlmTransient(_) => ErrorKind::Transient,
            Self::LlmFatal(_) | Self::LlmParse(_) | Self::ToolFatal { .. } => ErrorKind::Fatal,
            Self::ToolNotFound(_)
            | Self::ToolExecution { .. }
            | Self::ToolTimeout { .. }
            | Self::ToolValidation(_) => ErrorKind::Recoverable,
            Self::Conflict { .. } | Self::InvalidDelta(_) => ErrorKind::Conflict,
            Self::GraphConfig(_) => ErrorKind::GraphConfig,
            Self::StepLimitExceeded(_) => ErrorKind::StepLimitExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::SessionBusy(_) => ErrorKind::SessionBusy,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LlmTransient(_))
    }

    /// Tool failures that are folded into the conversation instead of ending the run.
    pub fn is_recoverable_tool_error(&self) -> bool {
        self.kind() == ErrorKind::Recoverable
    }
}

pub type Result<T> = std::result::Result<T, BraidError>;
