//! MCP (Model Context Protocol) client for Conduit.
//!
//! Talks newline-delimited JSON-RPC 2.0 to a server running as a child
//! process. [`McpClient`] owns one connection: it launches the process,
//! performs the initialize handshake, and correlates concurrent requests
//! with their responses.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod jsonrpc;
mod pending;
pub mod transport;
pub mod types;

pub use client::{McpClient, PROTOCOL_VERSION};
pub use config::{McpConfig, ServerDescriptor};
pub use error::McpError;
pub use events::{ConnectionEvent, ConnectionState, Direction, TraceSink, TracingSink};
pub use jsonrpc::{Envelope, Notification, Request, RequestId, Response, RpcErrorObject};
pub use transport::{ProcessTransport, Transport};
pub use types::{
    McpToolInfo, ResourceContents, ResourceInfo, ServerInfo, ToolCallError, ToolCallResult,
    ToolContent,
};
