//! JSON-RPC 2.0 envelopes for MCP communication.
//!
//! Every line on the wire is one envelope. Classification happens in exactly
//! one place, [`Envelope::decode`], by looking at which of `id` / `method` is
//! present.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Protocol tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// A request id. Numeric and string ids are both valid and never equal to
/// each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A call that expects a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A one-way message (no id, no response expected).
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// The answer to a [`Request`], carrying exactly one of result or error.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: ResponseOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcErrorObject),
}

impl Response {
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Result(result),
        }
    }

    pub fn failure(id: impl Into<RequestId>, error: RpcErrorObject) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Error(error),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcErrorObject> {
        match self.outcome {
            ResponseOutcome::Result(value) => Ok(value),
            ResponseOutcome::Error(err) => Err(err),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// One JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// Why a line could not be turned into an [`Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("id must be a number or a string")]
    InvalidId,

    #[error("method must be a string")]
    InvalidMethod,

    #[error("message has neither id nor method")]
    Unclassifiable,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl Envelope {
    /// Serialize to a single line of JSON (without the trailing newline).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Classify and parse one line.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = serde_json::from_str::<Value>(line)? else {
            return Err(DecodeError::NotAnObject);
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw).map_err(|_| DecodeError::InvalidId)?),
        };
        let method = match obj.remove("method") {
            None => None,
            Some(Value::String(m)) => Some(m),
            Some(_) => return Err(DecodeError::InvalidMethod),
        };
        let params = obj.remove("params");

        match (id, method) {
            (Some(id), Some(method)) => Ok(Envelope::Request(Request { id, method, params })),
            (None, Some(method)) => Ok(Envelope::Notification(Notification { method, params })),
            (Some(id), None) => {
                let result = obj.remove("result");
                // Some peers send `"error": null` next to a result.
                let error = obj.remove("error").filter(|e| !e.is_null());
                let outcome = match (result, error) {
                    (Some(result), None) => ResponseOutcome::Result(result),
                    (None, Some(error)) => ResponseOutcome::Error(
                        serde_json::from_value(error)
                            .map_err(|e| DecodeError::InvalidResponse(format!("error object: {e}")))?,
                    ),
                    (Some(_), Some(_)) => {
                        return Err(DecodeError::InvalidResponse(
                            "both result and error present".into(),
                        ));
                    }
                    (None, None) => {
                        return Err(DecodeError::InvalidResponse(
                            "neither result nor error present".into(),
                        ));
                    }
                };
                Ok(Envelope::Response(Response { id, outcome }))
            }
            (None, None) => Err(DecodeError::Unclassifiable),
        }
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.method),
            Envelope::Notification(n) => Some(&n.method),
            Envelope::Response(_) => None,
        }
    }

    /// The id for requests and responses.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Envelope::Request(r) => Some(&r.id),
            Envelope::Response(r) => Some(&r.id),
            Envelope::Notification(_) => None,
        }
    }
}

impl From<Request> for Envelope {
    fn from(r: Request) -> Self {
        Envelope::Request(r)
    }
}

impl From<Notification> for Envelope {
    fn from(n: Notification) -> Self {
        Envelope::Notification(n)
    }
}

impl From<Response> for Envelope {
    fn from(r: Response) -> Self {
        Envelope::Response(r)
    }
}

/// Flat wire shape used for encoding.
#[derive(Serialize)]
struct WireEnvelope<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RpcErrorObject>,
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut wire = WireEnvelope {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match self {
            Envelope::Request(r) => {
                wire.id = Some(&r.id);
                wire.method = Some(&r.method);
                wire.params = r.params.as_ref();
            }
            Envelope::Notification(n) => {
                wire.method = Some(&n.method);
                wire.params = n.params.as_ref();
            }
            Envelope::Response(r) => {
                wire.id = Some(&r.id);
                match &r.outcome {
                    ResponseOutcome::Result(v) => wire.result = Some(v),
                    ResponseOutcome::Error(e) => wire.error = Some(e),
                }
            }
        }
        wire.serialize(serializer)
    }
}
