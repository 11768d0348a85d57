//! Relays worker events to the server

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::bridge::CANCELLED_UPDATE;
use super::client::SocketService;
use crate::events::{Event, EventHandler, EventKind, HandlerResult, JobRef};
use crate::worker::{JobProgress, JobResult};

/// Pattern the forwarder subscribes under
pub const PATTERN: &str = "doc:*";

/// `doc:progress`, `doc:result` and `doc:cancelled` become server emits
///
/// While disconnected the emits are dropped by the socket service.
pub struct UpstreamForwarder {
    socket: Arc<SocketService>,
}

impl UpstreamForwarder {
    pub fn new(socket: Arc<SocketService>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl EventHandler for UpstreamForwarder {
    async fn handle(&self, event: &Event) -> HandlerResult {
        match EventKind::from_name(event.name()) {
            EventKind::DocProgress => {
                let progress: JobProgress = event.decode()?;
                self.socket
                    .send_progress(&progress.job_id, progress.progress, progress.status.as_str());
            }
            EventKind::DocResult => {
                let result: JobResult = event.decode()?;
                self.socket
                    .send_result(&result.job_id, result.success, result.output(), result.error.as_deref());
            }
            EventKind::DocCancelled => {
                let job: JobRef = event.decode()?;
                self.socket.emit(CANCELLED_UPDATE, json!({ "id": job.id }));
            }
            kind => debug!(event = event.name(), ?kind, "UpstreamForwarder::handle: not forwarded"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "UpstreamForwarder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DOC_CANCEL, DOC_CANCELLED, DOC_CONVERT, DOC_PROGRESS, DOC_RESULT, EventBus};
    use crate::transport::bridge::{PROGRESS_UPDATE, RESULT_UPDATE};
    use crate::transport::client::SocketConfig;
    use crate::transport::connector::{Auth, Connector, Inbound, Outbound, Session};
    use crate::transport::error::TransportError;
    use crate::transport::state::ConnectionState;
    use crate::worker::JobStatus;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Accepts once and keeps the server side of the session
    struct OneShot {
        server: Mutex<Option<(mpsc::UnboundedSender<Inbound>, mpsc::UnboundedReceiver<Outbound>)>>,
        session: Mutex<Option<Session>>,
    }

    impl OneShot {
        fn new() -> Arc<Self> {
            let (session, inbound, outbound) = Session::channel();
            Arc::new(Self {
                server: Mutex::new(Some((inbound, outbound))),
                session: Mutex::new(Some(session)),
            })
        }

        fn take_server(&self) -> (mpsc::UnboundedSender<Inbound>, mpsc::UnboundedReceiver<Outbound>) {
            self.server.lock().unwrap().take().unwrap()
        }
    }

    #[async_trait]
    impl Connector for OneShot {
        async fn connect(&self, _auth: &Auth) -> Result<Session, TransportError> {
            let session = self.session.lock().unwrap().take();
            match session {
                Some(session) => Ok(session),
                None => std::future::pending().await,
            }
        }
    }

    async fn connected() -> (Arc<SocketService>, mpsc::UnboundedReceiver<Outbound>, mpsc::UnboundedSender<Inbound>) {
        let connector = OneShot::new();
        let socket = Arc::new(SocketService::new(
            SocketConfig::default(),
            connector.clone(),
            EventBus::default(),
        ));
        let runner = socket.clone();
        tokio::spawn(async move { runner.connect().await });

        let mut state = socket.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        let (inbound, outbound) = connector.take_server();
        (socket, outbound, inbound)
    }

    fn expect_emit(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> (String, serde_json::Value) {
        match outbound.try_recv() {
            Ok(Outbound::Emit { event, data }) => (event, data),
            other => panic!("expected emit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_progress_forwarded() {
        let (socket, mut outbound, _inbound) = connected().await;
        let forwarder = UpstreamForwarder::new(socket.clone());

        let event = Event::new(DOC_PROGRESS).with_payload(JobProgress::new("j1", 50, JobStatus::Processing, "half"));
        forwarder.handle(&event).await.unwrap();

        let (name, data) = expect_emit(&mut outbound);
        assert_eq!(name, PROGRESS_UPDATE);
        assert_eq!(data, json!({"id": "j1", "progress": 50, "status": "processing"}));
        socket.disconnect();
    }

    #[tokio::test]
    async fn test_result_forwarded() {
        let (socket, mut outbound, _inbound) = connected().await;
        let forwarder = UpstreamForwarder::new(socket.clone());

        let mut ok = JobResult::success("j1");
        ok.output_text = Some("hello".to_string());
        forwarder
            .handle(&Event::new(DOC_RESULT).with_payload(&ok))
            .await
            .unwrap();
        let (name, data) = expect_emit(&mut outbound);
        assert_eq!(name, RESULT_UPDATE);
        assert_eq!(data["id"], "j1");
        assert_eq!(data["success"], true);
        assert_eq!(data["result"]["output_text"], "hello");
        assert!(data["error"].is_null());

        forwarder
            .handle(&Event::new(DOC_RESULT).with_payload(JobResult::cancelled("j2")))
            .await
            .unwrap();
        let (_, data) = expect_emit(&mut outbound);
        assert_eq!(data["success"], false);
        assert_eq!(data["error"], "Job cancelled");
        assert!(data["result"].is_null());
        socket.disconnect();
    }

    #[tokio::test]
    async fn test_cancelled_forwarded_and_others_ignored() {
        let (socket, mut outbound, _inbound) = connected().await;
        let forwarder = UpstreamForwarder::new(socket.clone());

        forwarder
            .handle(&Event::new(DOC_CANCELLED).with_payload(json!({"id": 7})))
            .await
            .unwrap();
        let (name, data) = expect_emit(&mut outbound);
        assert_eq!(name, CANCELLED_UPDATE);
        assert_eq!(data, json!({"id": "7"}));

        forwarder
            .handle(&Event::new(DOC_CONVERT).with_payload(json!({"id": "x"})))
            .await
            .unwrap();
        assert!(outbound.try_recv().is_err());
        socket.disconnect();
    }

    #[tokio::test]
    async fn test_inbound_doc_events_not_echoed() {
        let (socket, mut outbound, _inbound) = connected().await;
        let forwarder = UpstreamForwarder::new(socket.clone());

        // matched by the doc:* pattern, yet they come from the server
        for name in [DOC_CONVERT, DOC_CANCEL, "doc:custom"] {
            forwarder
                .handle(&Event::new(name).with_payload(json!({"id": "x"})))
                .await
                .unwrap();
        }
        assert!(outbound.try_recv().is_err());
        socket.disconnect();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_handler_error() {
        let (socket, mut outbound, _inbound) = connected().await;
        let forwarder = UpstreamForwarder::new(socket.clone());

        let err = forwarder
            .handle(&Event::new(DOC_PROGRESS).with_payload(json!({"progress": "lots"})))
            .await;
        assert!(err.is_err());
        assert!(outbound.try_recv().is_err());
        socket.disconnect();
    }

    #[tokio::test]
    async fn test_dropped_while_disconnected() {
        let socket = Arc::new(SocketService::new(
            SocketConfig::default(),
            OneShot::new(),
            EventBus::default(),
        ));
        let forwarder = UpstreamForwarder::new(socket.clone());
        let result = forwarder
            .handle(&Event::new(DOC_CANCELLED).with_payload(json!({"id": "a"})))
            .await;
        assert!(result.is_ok());
    }
}
