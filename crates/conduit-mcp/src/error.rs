//! Error types for MCP operations.

use thiserror::Error;

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to launch MCP server '{command}': {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },

    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP server '{server}' is not ready (handshake not complete)")]
    NotReady { server: String },

    #[error("JSON-RPC error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("MCP server '{server}' rejected initialization (code {code}): {message}")]
    Initialize {
        server: String,
        code: i64,
        message: String,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("MCP request '{method}' was cancelled")]
    Cancelled { method: String },

    #[error("MCP server connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    pub(crate) fn not_connected() -> Self {
        McpError::Transport("not connected".to_string())
    }
}

impl From<crate::jsonrpc::RpcErrorObject> for McpError {
    fn from(err: crate::jsonrpc::RpcErrorObject) -> Self {
        McpError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
