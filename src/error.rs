//! Error types for S3 Butler operations.

use rmcp::ErrorData as McpError;
use thiserror::Error;

/// Main error type for S3 Butler operations.
///
/// Façade errors keep their kind all the way to the MCP boundary so a
/// client can tell "bucket doesn't exist" apart from "backend unreachable".
#[derive(Error, Debug)]
pub enum ButlerError {
    /// Required setting missing or unparseable — fatal at startup
    #[error("invalid configuration: {var}: {reason}")]
    Config { var: String, reason: String },

    /// Credentials rejected by the storage, identity, or analytics backend
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Network or connection failure against a named backend
    #[error("backend '{backend}' unavailable: {message}")]
    Upstream { backend: String, message: String },

    /// Referenced bucket does not exist
    #[error("bucket '{0}' not found")]
    NotFound(String),

    /// Dispatch of a tool name that was never registered
    #[error("unknown tool: {0}")]
    ToolNotFound(String),

    /// Tool arguments do not match the declared input schema
    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// Two tools registered under the same name — fatal at startup
    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),
}

impl ButlerError {
    /// Convenience constructor for missing required environment variables.
    pub fn missing_var(var: &str) -> Self {
        ButlerError::Config {
            var: var.to_string(),
            reason: "required variable is not set".to_string(),
        }
    }
}

impl From<ButlerError> for McpError {
    /// Map to an MCP protocol error without collapsing the error kind.
    fn from(err: ButlerError) -> Self {
        match &err {
            ButlerError::ToolNotFound(_) | ButlerError::InvalidArguments { .. } => {
                McpError::invalid_params(err.to_string(), None)
            }
            ButlerError::NotFound(_) => McpError::resource_not_found(err.to_string(), None),
            _ => McpError::internal_error(err.to_string(), None),
        }
    }
}

/// Result type alias for S3 Butler operations.
pub type Result<T> = std::result::Result<T, ButlerError>;
