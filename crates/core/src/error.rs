//! Error types for the Parley protocol engine.
//!
//! Uses `thiserror` for ergonomic error definitions. The protocol layer
//! never retries: every variant surfaces to the immediate caller.

use thiserror::Error;

/// The top-level error type for all Parley operations.
///
/// `Clone` so that a failure recorded inside a shared stream buffer can be
/// handed to every reader of that buffer.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A serialized history record had zero or several kind keys, an
    /// unknown kind key, or a payload of the wrong shape.
    #[error("Malformed history: {0}")]
    MalformedHistory(String),

    /// The backend response lacked a required field or a stream ended
    /// without its terminal condition.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Tool calls returned by the model do not match the declared tools.
    #[error("Invalid tool call: {0}")]
    InvalidToolCall(String),

    #[error("Cycle limit of {limit} exceeded")]
    CycleLimitExceeded { limit: u32 },

    /// Streaming assembly finished without every fragment of a call.
    #[error("Incomplete tool call at index {index}: missing {missing}")]
    IncompleteToolCall { index: u32, missing: &'static str },

    // --- Tool function failures, propagated uncaught ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Backend I/O ---
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Shorthand for a missing or unusable setting.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("No toolfunction provided")]
    NotProvided,
}
