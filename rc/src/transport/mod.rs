//! Server link
//!
//! A Socket.IO v5 client over Engine.IO v4 WebSocket frames, a reconnecting
//! service that bridges server events onto the bus, and the forwarder that
//! sends worker results back.

mod backoff;
mod bridge;
mod client;
mod connector;
mod error;
mod forwarder;
mod protocol;
mod state;

pub use backoff::{BACKOFF_FLOOR, Backoff, DEFAULT_BACKOFF_CEILING};
pub use bridge::{
    CANCEL_REQUEST, CANCELLED_UPDATE, CONVERT_REQUEST, MESSAGE, NOTIFICATION, PROGRESS_UPDATE, RESULT_UPDATE,
    SOURCE, inbound_event,
};
pub use client::{SocketConfig, SocketService};
pub use connector::{Auth, Connector, Inbound, Keepalive, Outbound, Session, WsConnector};
pub use error::TransportError;
pub use forwarder::{PATTERN as FORWARDED_EVENTS, UpstreamForwarder};
pub use protocol::{ENGINE_IO_VERSION, EnginePacket, OpenInfo, ProtocolError, SOCKET_IO_PATH, SocketPacket, socket_url};
pub use state::ConnectionState;
