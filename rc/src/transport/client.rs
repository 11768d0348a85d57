//! Reconnecting Socket.IO client

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{BACKOFF_FLOOR, Backoff, DEFAULT_BACKOFF_CEILING};
use super::bridge::{self, PROGRESS_UPDATE, RESULT_UPDATE, SOURCE};
use super::connector::{Auth, Connector, Inbound, Outbound, Session};
use super::error::TransportError;
use super::state::ConnectionState;
use crate::config::ServerConfig;
use crate::events::{Event, EventBus, SOCKET_CONNECTED, SOCKET_DISCONNECTED, SOCKET_ERROR, SocketErrorPayload};

/// Connection settings for [`SocketService`]
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub auth: Auth,

    /// Bound on a single connect attempt, handshake included
    pub connect_timeout: Duration,

    /// Backoff ceiling
    pub reconnect_max_delay: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            auth: Auth::default(),
            connect_timeout: Duration::from_secs(10),
            reconnect_max_delay: DEFAULT_BACKOFF_CEILING,
        }
    }
}

impl From<&ServerConfig> for SocketConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            auth: Auth::new(server.api_key.clone(), Some(server.user_email.clone())),
            connect_timeout: Duration::from_secs(server.connect_timeout_secs),
            reconnect_max_delay: Duration::from_secs(server.reconnect_max_delay_secs),
        }
    }
}

/// Owns the one logical connection to the server
///
/// [`SocketService::connect`] runs until [`SocketService::disconnect`]; every
/// transition is published on the bus as `socket:*`.
pub struct SocketService {
    connector: Arc<dyn Connector>,
    bus: EventBus,
    config: SocketConfig,
    state: watch::Sender<ConnectionState>,
    stop: CancellationToken,
    link: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl SocketService {
    pub fn new(config: SocketConfig, connector: Arc<dyn Connector>, bus: EventBus) -> Self {
        debug!(?config.connect_timeout, ?config.reconnect_max_delay, "SocketService::new: called");
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            bus,
            config,
            state,
            stop: CancellationToken::new(),
            link: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect and keep reconnecting until `disconnect` is called
    pub async fn connect(&self) {
        info!("Connecting to server...");
        let mut backoff = Backoff::new(BACKOFF_FLOOR, self.config.reconnect_max_delay);

        while !self.stop.is_cancelled() {
            self.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                attempt = timeout(self.config.connect_timeout, self.connector.connect(&self.config.auth)) => attempt,
            };

            match attempt {
                Ok(Ok(session)) => {
                    backoff.reset();
                    self.hold(session).await;
                }
                Ok(Err(e)) => self.report_failure(&e),
                Err(_) => self.report_failure(&TransportError::Timeout(self.config.connect_timeout)),
            }

            if self.stop.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            info!(?delay, "Reconnecting...");
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Stopped);
        debug!("SocketService::connect: loop exited");
    }

    /// Stop reconnecting and close the live session, if any
    ///
    /// Wakes a pending connect attempt or backoff sleep immediately.
    pub fn disconnect(&self) {
        debug!("SocketService::disconnect: called");
        self.stop.cancel();
        if let Some(link) = self.lock_link().take() {
            let _ = link.send(Outbound::Disconnect);
        }
        self.state.send_replace(ConnectionState::Stopped);
        info!("Socket service stopped");
    }

    /// Send an event to the server
    ///
    /// Dropped with a warning while not connected. Returns whether the event was
    /// handed to the live session.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        let link = self.lock_link();
        let Some(link) = link.as_ref().filter(|_| self.is_connected()) else {
            warn!(%event, "Cannot emit: not connected");
            return false;
        };

        match link.send(Outbound::Emit {
            event: event.to_string(),
            data,
        }) {
            Ok(()) => {
                debug!(%event, "Emitted");
                true
            }
            Err(_) => {
                error!(%event, "Failed to emit: session closed");
                false
            }
        }
    }

    pub fn send_progress(&self, job_id: &str, progress: u8, status: &str) -> bool {
        self.emit(
            PROGRESS_UPDATE,
            json!({
                "id": job_id,
                "progress": progress,
                "status": status,
            }),
        )
    }

    pub fn send_result(&self, job_id: &str, success: bool, result: Option<Value>, error: Option<&str>) -> bool {
        self.emit(
            RESULT_UPDATE,
            json!({
                "id": job_id,
                "success": success,
                "result": result,
                "error": error,
            }),
        )
    }

    /// Stay on one session until it drops or a disconnect is requested
    async fn hold(&self, mut session: Session) {
        *self.lock_link() = Some(session.outbound.clone());
        self.set_state(ConnectionState::Connected);
        info!("Connected to server");
        self.bus.publish(Event::new(SOCKET_CONNECTED).with_source(SOURCE));

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    let _ = session.outbound.send(Outbound::Disconnect);
                    break "disconnect requested".to_string();
                }
                inbound = session.inbound.recv() => match inbound {
                    Some(Inbound::Event { name, data }) => self.bus.publish(bridge::inbound_event(&name, data)),
                    Some(Inbound::Closed { reason }) => break reason,
                    None => break "session ended".to_string(),
                },
            }
        };

        self.lock_link().take();
        self.set_state(ConnectionState::Disconnected);
        warn!(%reason, "Disconnected from server");
        self.bus.publish(Event::new(SOCKET_DISCONNECTED).with_source(SOURCE));
    }

    fn report_failure(&self, e: &TransportError) {
        self.set_state(ConnectionState::Disconnected);
        warn!(error = %e, "Connection failed");
        self.bus.publish(
            Event::new(SOCKET_ERROR)
                .with_payload(SocketErrorPayload { error: e.to_string() })
                .with_source(SOURCE),
        );
    }

    /// Move to `next` unless already stopped
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "SocketService: state change");
            *current = next;
            true
        });
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
