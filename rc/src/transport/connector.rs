//! Connection seam between `SocketService` and the wire
//!
//! A [`Connector`] performs one full handshake and hands back a [`Session`]: a
//! pair of channels to a task that owns the socket. The service never touches
//! frames, so tests can drive it with an in-memory connector.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use super::error::TransportError;
use super::protocol::{EnginePacket, OpenInfo, SocketPacket, socket_url};

/// Credentials sent in the Socket.IO connect packet
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub api_key: String,
    pub email: Option<String>,
}

impl Auth {
    pub fn new(api_key: impl Into<String>, email: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            email: email.filter(|e| !e.is_empty()),
        }
    }

    /// `{"apiKey": .., "email": ..}`, email only when set
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("apiKey".to_string(), Value::String(self.api_key.clone()));
        if let Some(email) = &self.email {
            map.insert("email".to_string(), Value::String(email.clone()));
        }
        Value::Object(map)
    }
}

/// Something the server sent
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event { name: String, data: Value },
    /// The link is gone; nothing follows
    Closed { reason: String },
}

/// Something to send to the server
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Emit { event: String, data: Value },
    Disconnect,
}

/// One established connection
#[derive(Debug)]
pub struct Session {
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    /// Build both channel halves; the caller keeps the far ends
    pub fn channel() -> (Self, mpsc::UnboundedSender<Inbound>, mpsc::UnboundedReceiver<Outbound>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = Self {
            inbound: in_rx,
            outbound: out_tx,
        };
        (session, in_tx, out_rx)
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link and complete the handshake
    async fn connect(&self, auth: &Auth) -> Result<Session, TransportError>;
}

/// Keepalive expectations that must match the server
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Keepalive {
    /// Longest silence before the link is considered dead
    pub fn deadline(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(60),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Socket.IO over a real WebSocket
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    keepalive: Keepalive,
}

impl WsConnector {
    pub fn new(base_url: &str, keepalive: Keepalive) -> Result<Self, TransportError> {
        debug!(%base_url, "WsConnector::new: called");
        let url = socket_url(base_url)?;
        Ok(Self { url, keepalive })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn check_keepalive(&self, open: &OpenInfo) {
        let interval = Duration::from_millis(open.ping_interval);
        let timeout = Duration::from_millis(open.ping_timeout);
        if interval != self.keepalive.ping_interval || timeout != self.keepalive.ping_timeout {
            warn!(
                server_interval = ?interval,
                server_timeout = ?timeout,
                local_interval = ?self.keepalive.ping_interval,
                local_timeout = ?self.keepalive.ping_timeout,
                "Server keepalive differs from configuration"
            );
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, auth: &Auth) -> Result<Session, TransportError> {
        debug!(url = %self.url, "WsConnector::connect: called");
        let (stream, _response) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = stream.split();

        let open = match next_packet(&mut read).await? {
            EnginePacket::Open(open) => open,
            other => return Err(TransportError::Handshake(format!("expected open packet, got {:?}", other))),
        };
        debug!(sid = %open.sid, "WsConnector::connect: engine.io open");
        self.check_keepalive(&open);

        write
            .send(Message::text(SocketPacket::Connect(auth.to_json()).to_frame()))
            .await?;

        loop {
            match next_packet(&mut read).await? {
                EnginePacket::Ping(data) => {
                    write.send(Message::text(EnginePacket::Pong(data).encode())).await?;
                }
                EnginePacket::Message(body) => match SocketPacket::decode(&body)? {
                    SocketPacket::Connect(ack) => {
                        info!(sid = ?ack.get("sid"), "Socket.IO session established");
                        break;
                    }
                    SocketPacket::ConnectError(message) => return Err(TransportError::Rejected(message)),
                    other => debug!(?other, "WsConnector::connect: ignoring packet before connect ack"),
                },
                EnginePacket::Close => return Err(TransportError::Closed("server closed during handshake".to_string())),
                _ => {}
            }
        }

        let (session, inbound_tx, outbound_rx) = Session::channel();
        tokio::spawn(run_link(write, read, inbound_tx, outbound_rx, self.keepalive));
        Ok(session)
    }
}

/// Next Engine.IO packet from a text frame, skipping control frames
async fn next_packet(read: &mut WsReader) -> Result<EnginePacket, TransportError> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => return Ok(EnginePacket::decode(text.as_str())?),
            Some(Ok(Message::Close(frame))) => {
                return Err(TransportError::Closed(format!("{:?}", frame)));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::Closed("stream ended".to_string())),
        }
    }
}

/// Own the socket for one session: reader, writer and ping watchdog
async fn run_link(
    mut write: WsWriter,
    mut read: WsReader,
    inbound: mpsc::UnboundedSender<Inbound>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    keepalive: Keepalive,
) {
    debug!("run_link: called");
    let deadline = keepalive.deadline();
    let watchdog = sleep(deadline);
    tokio::pin!(watchdog);

    let reason = loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match EnginePacket::decode(text.as_str()) {
                    Ok(EnginePacket::Ping(data)) => {
                        watchdog.as_mut().reset(Instant::now() + deadline);
                        if let Err(e) = write.send(Message::text(EnginePacket::Pong(data).encode())).await {
                            break format!("pong failed: {}", e);
                        }
                    }
                    Ok(EnginePacket::Message(body)) => match SocketPacket::decode(&body) {
                        Ok(SocketPacket::Event { name, data }) => {
                            if inbound.send(Inbound::Event { name, data }).is_err() {
                                break "session dropped".to_string();
                            }
                        }
                        Ok(SocketPacket::Disconnect) => break "server disconnect".to_string(),
                        Ok(other) => debug!(?other, "run_link: ignoring packet"),
                        Err(e) => warn!(error = %e, "Dropping undecodable socket.io packet"),
                    },
                    Ok(EnginePacket::Close) => break "server close".to_string(),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Dropping undecodable engine.io packet"),
                },
                Some(Ok(Message::Close(frame))) => break format!("closed by peer: {:?}", frame),
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("websocket error: {}", e),
                None => break "stream ended".to_string(),
            },
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Emit { event, data }) => {
                    let frame = SocketPacket::Event { name: event, data }.to_frame();
                    if let Err(e) = write.send(Message::text(frame)).await {
                        break format!("send failed: {}", e);
                    }
                }
                Some(Outbound::Disconnect) | None => {
                    let _ = write.send(Message::text(SocketPacket::Disconnect.to_frame())).await;
                    let _ = write.close().await;
                    break "client disconnect".to_string();
                }
            },
            _ = &mut watchdog => break format!("no ping within {:?}", deadline),
        }
    };

    debug!(%reason, "run_link: link closed");
    let _ = inbound.send(Inbound::Closed { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_json_omits_empty_email() {
        assert_eq!(Auth::new("key", None).to_json(), json!({"apiKey": "key"}));
        assert_eq!(Auth::new("key", Some(String::new())).to_json(), json!({"apiKey": "key"}));
        assert_eq!(
            Auth::new("key", Some("a@b.c".to_string())).to_json(),
            json!({"apiKey": "key", "email": "a@b.c"})
        );
    }

    #[test]
    fn test_keepalive_deadline() {
        let keepalive = Keepalive {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(20),
        };
        assert_eq!(keepalive.deadline(), Duration::from_secs(45));
    }

    #[test]
    fn test_ws_connector_derives_socket_url() {
        let connector = WsConnector::new("http://localhost:3000", Keepalive::default()).unwrap();
        assert_eq!(connector.url().scheme(), "ws");
        assert_eq!(connector.url().path(), "/socket.io/");

        assert!(WsConnector::new("mailto:x@y", Keepalive::default()).is_err());
    }

    #[tokio::test]
    async fn test_session_channel_pairs() {
        let (mut session, inbound_tx, mut outbound_rx) = Session::channel();
        inbound_tx
            .send(Inbound::Event {
                name: "message".to_string(),
                data: json!("hi"),
            })
            .unwrap();
        session.outbound.send(Outbound::Disconnect).unwrap();

        assert!(matches!(session.inbound.recv().await, Some(Inbound::Event { .. })));
        assert_eq!(outbound_rx.recv().await, Some(Outbound::Disconnect));
    }
}
