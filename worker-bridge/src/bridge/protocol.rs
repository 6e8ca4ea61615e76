//! Wire protocol types for controller-worker communication.
//!
//! One channel carries two unrelated inbound streams:
//! - **Terminal replies**: answer the single in-flight command. They carry no id;
//!   the oldest pending command is always the one being answered.
//! - **Body fragments**: streamed response body for the handler currently executing,
//!   routed by request id and terminated by an end marker.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// `msg` tag that marks an inbound message as a body fragment.
pub const BODY_TAG: &str = "body";

/// Identifier of one handler invocation and its response body stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commands from controller to worker.
///
/// Everything except [`Command::EndOfRequest`] is answered by exactly one terminal reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    /// One-time initialization of a fresh worker.
    InitWorker { id: u64 },

    ReadWorkerChannel,

    /// Load and compile the handler module at `path`.
    ImportEndpoint {
        path: String,
        #[serde(rename = "apiVersion")]
        api_version: String,
        version: u64,
    },

    /// Mark a previously imported endpoint as ready to serve.
    ActivateEndpoint { path: String },

    /// Invoke a handler. The worker streams the response body as fragments tagged with `id`
    /// and answers with a [`HandlerReply`].
    CallHandler {
        path: String,
        #[serde(rename = "apiVersion")]
        api_version: String,
        id: RequestId,
    },

    /// Teardown notification, never answered.
    EndOfRequest { id: RequestId },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitWorker { .. } => "initWorker",
            Self::ReadWorkerChannel => "readWorkerChannel",
            Self::ImportEndpoint { .. } => "importEndpoint",
            Self::ActivateEndpoint { .. } => "activateEndpoint",
            Self::CallHandler { .. } => "callHandler",
            Self::EndOfRequest { .. } => "endOfRequest",
        }
    }

    pub fn expects_reply(&self) -> bool {
        !matches!(self, Self::EndOfRequest { .. })
    }

    /// Request whose body stream this command produces, if any.
    pub fn body_request(&self) -> Option<RequestId> {
        match self {
            Self::CallHandler { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Reply value of a successful `callHandler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerReply {
    pub status: u16,
    /// Opaque worker-side handle for the response headers.
    pub headers: u32,
}

/// Inbound message as it appears on the wire.
///
/// `msg == "body"` marks a body fragment; anything else is a terminal reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawWorkerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<serde_json::Value>,
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Body fragment for `id`. `chunk: None` is the end marker.
    Body { id: RequestId, chunk: Option<Bytes> },

    /// Terminal reply for the in-flight command.
    Reply(Result<serde_json::Value, String>),
}

impl WorkerMessage {
    pub fn chunk(id: RequestId, chunk: impl Into<Bytes>) -> Self {
        Self::Body {
            id,
            chunk: Some(chunk.into()),
        }
    }

    pub fn end_of_body(id: RequestId) -> Self {
        Self::Body { id, chunk: None }
    }

    pub fn ok(value: serde_json::Value) -> Self {
        Self::Reply(Ok(value))
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self::Reply(Err(error.into()))
    }
}

/// Inbound message with a shape the protocol does not allow.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("body fragment without request id")]
    MissingBodyId,
    #[error("body chunk must be a base64 string, got {0}")]
    InvalidChunk(&'static str),
    #[error("body chunk is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Whether an `err` field marks the reply as failed. Falsy values (`null`, `false`, `0`,
/// `""`) are treated as no error, as the worker runtime does.
fn is_error(err: &serde_json::Value) -> bool {
    match err {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

/// Error values may be plain strings or serialized error objects with a `message`.
fn error_text(err: serde_json::Value) -> String {
    if let Some(message) = err.get("message").and_then(serde_json::Value::as_str) {
        return message.to_string();
    }
    match err {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

impl TryFrom<RawWorkerMessage> for WorkerMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawWorkerMessage) -> Result<Self, Self::Error> {
        if raw.msg.as_deref() == Some(BODY_TAG) {
            let id = raw.id.ok_or(ProtocolError::MissingBodyId)?;
            let chunk = match raw.value {
                // JSON has no `undefined`, so an explicit null also ends the body.
                None | Some(serde_json::Value::Null) => None,
                Some(serde_json::Value::String(encoded)) => {
                    Some(Bytes::from(BASE64.decode(encoded.as_bytes())?))
                }
                Some(other) => return Err(ProtocolError::InvalidChunk(json_kind(&other))),
            };
            return Ok(Self::Body { id, chunk });
        }

        match raw.err {
            Some(err) if is_error(&err) => Ok(Self::Reply(Err(error_text(err)))),
            _ => Ok(Self::Reply(Ok(raw.value.unwrap_or(serde_json::Value::Null)))),
        }
    }
}

impl From<WorkerMessage> for RawWorkerMessage {
    fn from(msg: WorkerMessage) -> Self {
        match msg {
            WorkerMessage::Body { id, chunk } => Self {
                msg: Some(BODY_TAG.to_string()),
                id: Some(id),
                value: chunk.map(|c| serde_json::Value::String(BASE64.encode(&c))),
                err: None,
            },
            WorkerMessage::Reply(Ok(value)) => Self {
                value: Some(value),
                ..Self::default()
            },
            WorkerMessage::Reply(Err(error)) => Self {
                err: Some(serde_json::Value::String(error)),
                ..Self::default()
            },
        }
    }
}
