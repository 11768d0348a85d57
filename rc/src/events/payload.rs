//! Payload schema per event name
//!
//! The bus carries payloads as untyped JSON. Each consumer validates what it reads
//! through [`Event::decode`](super::Event::decode) into one of the typed shapes
//! below; [`EventKind`] is the table that says which shape belongs to which name.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::event::{
    DOC_CANCEL, DOC_CANCELLED, DOC_CONVERT, DOC_PROGRESS, DOC_RESULT, SERVER_MESSAGE, SHUTDOWN, SOCKET_CONNECTED,
    SOCKET_DISCONNECTED, SOCKET_ERROR, namespace_of,
};

/// A payload did not match the schema of its event
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Invalid payload for {event}: {source}")]
    Invalid {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Known event names and the payload each carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Raw job fields, decoded by `ConversionJob::from_payload`
    DocConvert,
    /// [`JobRef`]
    DocCancel,
    /// `JobProgress`
    DocProgress,
    /// `JobResult`
    DocResult,
    /// [`JobRef`]
    DocCancelled,
    /// No payload
    SocketConnected,
    /// No payload
    SocketDisconnected,
    /// [`SocketErrorPayload`]
    SocketError,
    /// Catch-all server message, any JSON object
    ServerMessage,
    /// `server:<type>` passthrough of a server notification
    ServerPassthrough(String),
    /// Reserved shutdown sentinel, no payload
    Shutdown,
    /// Anything else; the bus routes it but nothing here knows its shape
    Other(String),
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            DOC_CONVERT => Self::DocConvert,
            DOC_CANCEL => Self::DocCancel,
            DOC_PROGRESS => Self::DocProgress,
            DOC_RESULT => Self::DocResult,
            DOC_CANCELLED => Self::DocCancelled,
            SOCKET_CONNECTED => Self::SocketConnected,
            SOCKET_DISCONNECTED => Self::SocketDisconnected,
            SOCKET_ERROR => Self::SocketError,
            SERVER_MESSAGE => Self::ServerMessage,
            SHUTDOWN => Self::Shutdown,
            other => match namespace_of(other) {
                Some("server") => Self::ServerPassthrough(other["server:".len()..].to_string()),
                _ => Self::Other(other.to_string()),
            },
        }
    }

    /// Whether events of this kind carry no payload at all
    pub fn is_signal(&self) -> bool {
        matches!(
            self,
            Self::SocketConnected | Self::SocketDisconnected | Self::Shutdown
        )
    }
}

/// Payload of `socket:error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketErrorPayload {
    pub error: String,
}

/// Payload naming a job: `doc:cancel` and `doc:cancelled`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    #[serde(deserialize_with = "deserialize_job_id")]
    pub id: String,
}

/// Accept a job id given as a JSON string or number
pub fn deserialize_job_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected job id, got {}", other))),
    }
}

/// Read a job id from an arbitrary payload without validating the rest of it
pub fn job_id_of(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
