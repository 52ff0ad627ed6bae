//! Wire shapes of the Messages endpoint and their mapping to the
//! conversation model in `conduit-types`.
//!
//! Every block and chunk is discriminated by its `type` field. Block types
//! we don't model decode to `Unknown` and are dropped by the mapping.

use conduit_types::{
    ApiError, ChatDelta, ChatRequest, ChatResponse, ContentPart, ImageRef, Message, Role,
    StopReason, ToolDefinition, ToolUseStart, Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub(crate) struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

impl<'a> WireRequest<'a> {
    pub(crate) fn new(request: &'a ChatRequest, stream: bool) -> Result<Self, ApiError> {
        if request.messages.is_empty() {
            return Err(ApiError::InvalidRequest(
                "at least one message is required".into(),
            ));
        }
        Ok(Self {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.as_deref(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            tools: &request.tools,
            stream,
        })
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: Vec<WireBlock>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.iter().map(WireBlock::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WireBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

impl From<&ContentPart> for WireBlock {
    fn from(part: &ContentPart) -> Self {
        match part {
            ContentPart::Text { text } => WireBlock::Text { text: text.clone() },
            ContentPart::Image { image } => WireBlock::Image {
                source: match image {
                    ImageRef::Url(url) => ImageSource::Url { url: url.clone() },
                    ImageRef::Base64 { media_type, data } => ImageSource::Base64 {
                        media_type: media_type.clone(),
                        data: data.clone(),
                    },
                },
            },
            ContentPart::ToolUse { id, name, input } => WireBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => WireBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: Value::String(content.clone()),
                is_error: *is_error,
            },
        }
    }
}

impl WireBlock {
    /// Back to the internal model; `None` for block types we don't model.
    pub(crate) fn into_part(self) -> Option<ContentPart> {
        match self {
            WireBlock::Text { text } => Some(ContentPart::Text { text }),
            WireBlock::Image { source } => Some(ContentPart::Image {
                image: match source {
                    ImageSource::Url { url } => ImageRef::Url(url),
                    ImageSource::Base64 { media_type, data } => {
                        ImageRef::Base64 { media_type, data }
                    }
                },
            }),
            WireBlock::ToolUse { id, name, input } => {
                Some(ContentPart::ToolUse { id, name, input })
            }
            WireBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(ContentPart::ToolResult {
                tool_use_id,
                content: flatten_tool_result(content),
                is_error,
            }),
            WireBlock::Unknown => None,
        }
    }
}

/// Tool results arrive as a string or as a list of text blocks.
fn flatten_tool_result(content: Value) -> String {
    match content {
        Value::String(s) => s,
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Unknown stop reasons are treated as absent.
fn parse_stop_reason(raw: Option<String>) -> Option<StopReason> {
    let raw = raw?;
    match serde_json::from_value(Value::String(raw.clone())) {
        Ok(reason) => Some(reason),
        Err(_) => {
            tracing::debug!("Unknown stop reason: {raw}");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireResponse {
    id: String,
    model: String,
    #[serde(default)]
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

impl From<WireResponse> for ChatResponse {
    fn from(wire: WireResponse) -> Self {
        ChatResponse {
            id: wire.id,
            model: wire.model,
            content: wire
                .content
                .into_iter()
                .filter_map(WireBlock::into_part)
                .collect(),
            stop_reason: parse_stop_reason(wire.stop_reason),
            usage: wire.usage,
        }
    }
}

/// One `data:` payload of a streamed reply.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum StreamChunk {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: WireBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop,
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamMessage {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

impl StreamChunk {
    /// Map to a delta. `Ok(None)` for chunks that carry nothing to report.
    pub(crate) fn into_delta(self) -> Result<Option<ChatDelta>, ApiError> {
        let delta = match self {
            StreamChunk::MessageStart { message } => ChatDelta {
                usage: message.usage,
                ..ChatDelta::default()
            },
            StreamChunk::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                WireBlock::ToolUse { id, name, .. } => ChatDelta {
                    index: Some(index),
                    tool_use: Some(ToolUseStart { id, name }),
                    ..ChatDelta::default()
                },
                WireBlock::Text { text } if !text.is_empty() => ChatDelta {
                    index: Some(index),
                    text: Some(text),
                    ..ChatDelta::default()
                },
                _ => return Ok(None),
            },
            StreamChunk::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => ChatDelta {
                    index: Some(index),
                    text: Some(text),
                    ..ChatDelta::default()
                },
                BlockDelta::InputJsonDelta { partial_json } => ChatDelta {
                    index: Some(index),
                    partial_json: Some(partial_json),
                    ..ChatDelta::default()
                },
                BlockDelta::Other => return Ok(None),
            },
            StreamChunk::MessageDelta { delta, usage } => ChatDelta {
                stop_reason: parse_stop_reason(delta.stop_reason),
                usage,
                ..ChatDelta::default()
            },
            StreamChunk::Error { error } => {
                return Err(ApiError::Remote {
                    error_type: error.error_type,
                    message: error.message,
                });
            }
            StreamChunk::ContentBlockStop
            | StreamChunk::MessageStop
            | StreamChunk::Ping
            | StreamChunk::Unknown => return Ok(None),
        };
        Ok((!delta.is_empty()).then_some(delta))
    }
}
