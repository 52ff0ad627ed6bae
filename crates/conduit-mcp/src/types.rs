//! Typed results of MCP operations and tolerant parsing of peer payloads.
//!
//! Peers vary: optional fields may be missing or have the wrong type, and
//! individual list entries may be malformed. Optional fields fall back to
//! absent, bad list entries are skipped with a warning.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Information about a tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A content item in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceContents,
    },
    #[serde(other)]
    Unsupported,
}

impl ToolContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Why a tool call did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolCallError {
    /// The peer answered with a JSON-RPC error object.
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// The tool ran and reported failure (`isError: true`).
    Tool { message: String },
}

/// Outcome of `tools/call`. A failed call is a value, not an `Err`, so a
/// conversation can carry on past one broken tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallResult {
    pub success: bool,
    pub content: Vec<ToolContent>,
    pub error: Option<ToolCallError>,
}

impl ToolCallResult {
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Concatenated text content, newline-separated.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ToolContent::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub(crate) fn from_rpc_error(err: crate::jsonrpc::RpcErrorObject) -> Self {
        Self {
            success: false,
            content: Vec::new(),
            error: Some(ToolCallError::Rpc {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
        }
    }

    pub(crate) fn from_value(value: Value) -> Self {
        let content = parse_list::<ToolContent>(value.get("content"), "tool content");
        let is_error = value
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let error = is_error.then(|| {
            let text = content
                .iter()
                .filter_map(ToolContent::as_text)
                .collect::<Vec<_>>()
                .join("\n");
            ToolCallError::Tool {
                message: if text.is_empty() {
                    "tool reported an error".to_string()
                } else {
                    text
                },
            }
        });
        Self {
            success: !is_error,
            content,
            error,
        }
    }
}

/// A resource advertised by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceInfo {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

/// One item of a `resources/read` result: text or base64 blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// What the server said about itself during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerInfo {
    pub protocol_version: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub capabilities: Value,
    pub instructions: Option<String>,
}

impl ServerInfo {
    pub(crate) fn from_value(value: &Value) -> Self {
        let info = value.get("serverInfo");
        Self {
            protocol_version: str_field(value, "protocolVersion"),
            name: info.and_then(|i| str_field(i, "name")),
            version: info.and_then(|i| str_field(i, "version")),
            capabilities: value
                .get("capabilities")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
            instructions: str_field(value, "instructions"),
        }
    }
}

#[derive(Deserialize)]
struct ToolEntry {
    name: String,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

pub(crate) fn parse_tools(result: &Value) -> Vec<McpToolInfo> {
    parse_list::<ToolEntry>(result.get("tools"), "tool")
        .into_iter()
        .map(|t| McpToolInfo {
            name: t.name,
            description: t
                .description
                .and_then(|d| d.as_str().map(str::to_string))
                .unwrap_or_default(),
            input_schema: t
                .input_schema
                .filter(Value::is_object)
                .unwrap_or_else(default_schema),
        })
        .collect()
}

#[derive(Deserialize)]
struct ResourceEntry {
    uri: String,
    #[serde(default)]
    name: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default, rename = "mimeType")]
    mime_type: Option<Value>,
}

pub(crate) fn parse_resources(result: &Value) -> Vec<ResourceInfo> {
    parse_list::<ResourceEntry>(result.get("resources"), "resource")
        .into_iter()
        .map(|r| {
            let name = r
                .name
                .and_then(|n| n.as_str().map(str::to_string))
                .unwrap_or_else(|| r.uri.clone());
            ResourceInfo {
                uri: r.uri,
                name,
                description: r.description.and_then(|d| d.as_str().map(str::to_string)),
                mime_type: r.mime_type.and_then(|m| m.as_str().map(str::to_string)),
            }
        })
        .collect()
}

pub(crate) fn parse_resource_contents(result: &Value) -> Vec<ResourceContents> {
    parse_list(result.get("contents"), "resource contents")
}

/// Pagination cursor for the next page, if any.
pub(crate) fn next_cursor(result: &Value) -> Option<String> {
    str_field(result, "nextCursor").filter(|c| !c.is_empty())
}

/// Parse each element of a JSON array, skipping the ones that don't fit.
fn parse_list<T: serde::de::DeserializeOwned>(list: Option<&Value>, what: &str) -> Vec<T> {
    let Some(Value::Array(items)) = list else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Skipping malformed {what} entry: {e}");
                None
            }
        })
        .collect()
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
