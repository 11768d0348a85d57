//! Socket.IO v5 over Engine.IO v4 text framing
//!
//! Only the subset a WebSocket-only client needs: no polling transport, no binary
//! attachments, no acknowledgements.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::error::TransportError;

/// Engine.IO protocol revision sent in the query string
pub const ENGINE_IO_VERSION: &str = "4";

/// Default Socket.IO mount path
pub const SOCKET_IO_PATH: &str = "/socket.io/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown {layer} packet type '{kind}'")]
    UnknownType { layer: &'static str, kind: char },

    #[error("Unsupported packet type '{0}'")]
    Unsupported(char),

    #[error("Malformed packet body: {0}")]
    Malformed(String),
}

/// Build the WebSocket endpoint for a server base URL
///
/// `http`/`https` map to `ws`/`wss`; an empty path becomes `/socket.io/`.
pub fn socket_url(base: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(base).map_err(|e| TransportError::invalid_url(base, e))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(TransportError::invalid_url(base, format!("unsupported scheme '{}'", other))),
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(TransportError::invalid_url(base, "cannot switch to a websocket scheme"));
    }

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(SOCKET_IO_PATH);
    }

    url.query_pairs_mut()
        .append_pair("EIO", ENGINE_IO_VERSION)
        .append_pair("transport", "websocket");

    Ok(url)
}

/// Handshake data the server sends in its `open` packet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,

    #[serde(default)]
    pub upgrades: Vec<String>,

    /// Milliseconds
    pub ping_interval: u64,

    /// Milliseconds
    pub ping_timeout: u64,

    #[serde(default)]
    pub max_payload: Option<u64>,
}

/// Engine.IO packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let body = chars.as_str();

        match kind {
            '0' => serde_json::from_str(body)
                .map(Self::Open)
                .map_err(|e| ProtocolError::Malformed(e.to_string())),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(body.to_string())),
            '3' => Ok(Self::Pong(body.to_string())),
            '4' => Ok(Self::Message(body.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(ProtocolError::UnknownType {
                layer: "engine.io",
                kind: other,
            }),
        }
    }

    /// Encode a client-side packet; `Open` is server-only and encodes as its tag
    pub fn encode(&self) -> String {
        match self {
            Self::Open(_) => "0".to_string(),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{}", data),
            Self::Pong(data) => format!("3{}", data),
            Self::Message(body) => format!("4{}", body),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

/// Socket.IO packet carried inside an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Client: auth object. Server: `{sid}`.
    Connect(Value),
    Disconnect,
    Event { name: String, data: Value },
    ConnectError(String),
}

impl SocketPacket {
    pub fn decode(body: &str) -> Result<Self, ProtocolError> {
        let mut chars = body.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let rest = skip_ack_id(skip_namespace(chars.as_str()));

        match kind {
            '0' => Ok(Self::Connect(parse_json(rest)?.unwrap_or(Value::Null))),
            '1' => Ok(Self::Disconnect),
            '2' => decode_event(rest),
            '4' => {
                let message = match parse_json(rest)? {
                    Some(Value::Object(map)) => map
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("connection rejected")
                        .to_string(),
                    Some(Value::String(s)) => s,
                    _ => "connection rejected".to_string(),
                };
                Ok(Self::ConnectError(message))
            }
            '3' | '5' | '6' => Err(ProtocolError::Unsupported(kind)),
            other => Err(ProtocolError::UnknownType {
                layer: "socket.io",
                kind: other,
            }),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Connect(Value::Null) => "0".to_string(),
            Self::Connect(auth) => format!("0{}", auth),
            Self::Disconnect => "1".to_string(),
            Self::Event { name, data } => {
                let mut args = vec![Value::String(name.clone())];
                if !data.is_null() {
                    args.push(data.clone());
                }
                format!("2{}", Value::Array(args))
            }
            Self::ConnectError(message) => format!("4{}", serde_json::json!({ "message": message })),
        }
    }

    /// Full text frame for this packet
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

fn skip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(pos) => &rest[pos + 1..],
            None => "",
        }
    } else {
        rest
    }
}

fn skip_ack_id(rest: &str) -> &str {
    rest.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_json(rest: &str) -> Result<Option<Value>, ProtocolError> {
    if rest.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(rest)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn decode_event(rest: &str) -> Result<SocketPacket, ProtocolError> {
    let Some(Value::Array(mut args)) = parse_json(rest)? else {
        return Err(ProtocolError::Malformed("event body is not an array".to_string()));
    };
    if args.is_empty() {
        return Err(ProtocolError::Malformed("event without a name".to_string()));
    }

    let name = match args.remove(0) {
        Value::String(name) => name,
        other => return Err(ProtocolError::Malformed(format!("event name is not a string: {}", other))),
    };

    let data = match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    };

    Ok(SocketPacket::Event { name, data })
}
