// ABOUTME: Typed event stream emitted by agent backends while a prompt runs.
// ABOUTME: One prompt produces zero or more progress events and exactly one terminal event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event produced by a backend during one prompt invocation.
///
/// A well-behaved backend emits any number of `Text`, `ToolStart`,
/// `ToolProgress`, `ToolEnd` and `Custom` events followed by exactly one
/// terminal event (`Result` or `Error`). A stream that ends without a
/// terminal event means the backend died mid-prompt; consumers must treat
/// that as an implicit error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AgentEvent {
    /// A chunk of streaming response text.
    Text(String),

    /// A tool invocation began.
    ToolStart {
        /// Identifier correlating this invocation's start/progress/end.
        id: String,
        /// Tool name as reported by the backend.
        name: String,
        /// Raw input handed to the tool.
        input: Value,
    },

    /// Backend-specific progress for a running tool.
    ToolProgress {
        /// Matches the `id` of the corresponding `ToolStart`.
        id: String,
        update: Value,
    },

    /// A tool invocation finished.
    ToolEnd {
        /// Matches the `id` of the corresponding `ToolStart`.
        id: String,
        name: String,
        output: Value,
        success: bool,
        duration_ms: u64,
    },

    /// Terminal: the prompt completed.
    Result {
        /// Final response text.
        text: String,
        /// Token accounting, when the backend reports it.
        usage: Option<Usage>,
        /// Backend-specific trailing metadata.
        metadata: Value,
    },

    /// Terminal: the prompt failed.
    Error {
        code: ErrorCode,
        message: String,
        /// True when retrying the same prompt may succeed.
        recoverable: bool,
    },

    /// The session id is no longer usable and must be recreated.
    SessionInvalid { reason: String },

    /// The backend switched to a different session id mid-prompt.
    SessionChanged { new_session_id: String },

    /// Escape hatch for backend-specific events (e.g. "agent.thought").
    Custom { kind: String, payload: Value },
}

/// Closed set of failure categories carried on [`AgentEvent::Error`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    RateLimited,
    AuthFailed,
    /// The backend no longer recognizes the session id.
    SessionOrphaned,
    ToolFailed,
    PermissionDenied,
    BackendError,
    Unknown,
}

impl ErrorCode {
    /// Stable lowercase label for logs and user-facing error lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::AuthFailed => "auth_failed",
            Self::SessionOrphaned => "session_orphaned",
            Self::ToolFailed => "tool_failed",
            Self::PermissionDenied => "permission_denied",
            Self::BackendError => "backend_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token and cost accounting attached to a terminal [`AgentEvent::Result`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    /// Anything else the backend reports that callers may want to keep.
    pub extra: Option<Value>,
}
