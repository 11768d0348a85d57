//! Integration tests for the RAGFlow client
//!
//! These tests verify end-to-end behavior across the bus, the worker and the
//! socket service. No network is used: the server side is an in-memory connector.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;

use ragflow_client::config::Config;
use ragflow_client::events::{
    DOC_CANCEL, DOC_CANCELLED, DOC_CONVERT, DOC_RESULT, Event, EventBus, HandlerResult, WILDCARD, handler_fn,
};
use ragflow_client::lifecycle::LifecycleManager;
use ragflow_client::transport::{
    Auth, CONVERT_REQUEST, Connector, Inbound, Outbound, PROGRESS_UPDATE, RESULT_UPDATE, Session, TransportError,
};
use ragflow_client::worker::{
    ConvertError, ConvertRequest, Converter, DocConverterWorker, DocumentProcessor, JobResult, ProcessorConfig,
    expected_output,
};

// =============================================================================
// Helpers
// =============================================================================

/// Holds every conversion until released or cancelled
struct HeldConverter {
    release: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl Converter for HeldConverter {
    fn name(&self) -> &str {
        "held"
    }

    fn supports(&self, extension: &str) -> bool {
        extension == "docx"
    }

    fn convert(&self, request: &ConvertRequest) -> Result<PathBuf, ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        while !self.release.load(Ordering::SeqCst) {
            if request.cancel.is_cancelled() {
                return Err(ConvertError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        std::fs::create_dir_all(&request.output_dir)?;
        let out = expected_output(&request.source, &request.output_dir);
        std::fs::write(&out, b"%PDF")?;
        Ok(out)
    }
}

struct Harness {
    temp_dir: TempDir,
    bus: EventBus,
    worker: DocConverterWorker,
    seen: Arc<Mutex<Vec<Event>>>,
    release: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let release = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let processor = DocumentProcessor::new(ProcessorConfig {
            output_dir: temp_dir.path().join("output"),
            ..ProcessorConfig::default()
        })
        .expect("Failed to build processor")
        .with_converter(Arc::new(HeldConverter {
            release: release.clone(),
            calls: calls.clone(),
        }));

        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            WILDCARD,
            handler_fn("recorder", move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event);
                    HandlerResult::Ok(())
                }
            }),
        );

        let worker = DocConverterWorker::new(bus.clone(), processor);
        bus.start();
        worker.start();

        Self {
            temp_dir,
            bus,
            worker,
            seen,
            release,
            calls,
        }
    }

    fn source(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, "content").unwrap();
        path
    }

    fn named(&self, name: &str) -> Vec<Event> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    async fn settle(&self, mut done: impl FnMut(&Self) -> bool) {
        for _ in 0..500 {
            if done(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Timed out waiting for condition");
    }

    async fn shutdown(&self) {
        self.worker.stop().await;
        self.bus.stop().await;
    }
}

// =============================================================================
// Worker Tests
// =============================================================================

#[tokio::test]
async fn test_duplicate_submission_yields_one_result() {
    let h = Harness::new();
    let source = h.source("a.docx");

    h.bus.publish(Event::new(DOC_CONVERT).with_payload(json!({"id": "X", "source_path": source})));
    h.bus.publish(Event::new(DOC_CONVERT).with_payload(json!({"id": "X", "source_path": source})));
    h.settle(|h| h.named(DOC_CONVERT).len() == 2).await;
    assert_eq!(h.worker.active_job_count(), 1);

    h.release.store(true, Ordering::SeqCst);
    h.settle(|h| h.worker.active_job_count() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let results = h.named(DOC_RESULT);
    assert_eq!(results.len(), 1, "Exactly one result per job id");
    let result: JobResult = results[0].decode().unwrap();
    assert_eq!(result.job_id, "X");
    assert!(result.success, "{:?}", result.error);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn test_cancel_in_flight_job() {
    let h = Harness::new();
    let source = h.source("b.docx");

    h.bus.publish(Event::new(DOC_CONVERT).with_payload(json!({"id": "Y", "source_path": source})));
    h.settle(|h| h.calls.load(Ordering::SeqCst) == 1).await;

    h.bus.publish(Event::new(DOC_CANCEL).with_payload(json!({"id": "Y"})));
    h.settle(|h| h.named(DOC_RESULT).len() == 1).await;
    h.settle(|h| h.worker.active_job_count() == 0).await;

    let cancelled = h.named(DOC_CANCELLED);
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].payload()["id"], "Y");

    let result: JobResult = h.named(DOC_RESULT)[0].decode().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Job cancelled"));
    h.shutdown().await;
}

#[tokio::test]
async fn test_cancel_unknown_job_publishes_nothing() {
    let h = Harness::new();

    h.bus.publish(Event::new(DOC_CANCEL).with_payload(json!({"id": "Z"})));
    h.settle(|h| h.named(DOC_CANCEL).len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let names: Vec<String> = h.seen.lock().unwrap().iter().map(|e| e.name().to_string()).collect();
    assert_eq!(names, vec![DOC_CANCEL.to_string()]);
    h.shutdown().await;
}

// =============================================================================
// Bus Tests
// =============================================================================

#[tokio::test]
async fn test_history_keeps_most_recent() {
    let bus = EventBus::new(5);
    bus.start();

    for i in 0..10 {
        bus.publish(Event::new("test:tick").with_payload(json!({"n": i})));
    }
    for _ in 0..500 {
        if bus.history().last().is_some_and(|e| e.payload()["n"] == 9) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen: Vec<Value> = bus.history().iter().map(|e| e.payload()["n"].clone()).collect();
    assert_eq!(seen, vec![json!(5), json!(6), json!(7), json!(8), json!(9)]);
    bus.stop().await;
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

type ServerEnds = (mpsc::UnboundedSender<Inbound>, mpsc::UnboundedReceiver<Outbound>);

/// Accepts the first connection and hands its far ends to the test
struct InMemoryServer {
    pending: Mutex<Option<Session>>,
}

impl InMemoryServer {
    fn new() -> (Arc<Self>, ServerEnds) {
        let (session, inbound, outbound) = Session::channel();
        let server = Arc::new(Self {
            pending: Mutex::new(Some(session)),
        });
        (server, (inbound, outbound))
    }
}

#[async_trait]
impl Connector for InMemoryServer {
    async fn connect(&self, auth: &Auth) -> Result<Session, TransportError> {
        assert_eq!(auth.api_key, "test-key");
        let session = self.pending.lock().unwrap().take();
        match session {
            Some(session) => Ok(session),
            None => Err(TransportError::Closed("server gone".to_string())),
        }
    }
}

#[tokio::test]
async fn test_server_request_round_trip() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let source = temp_dir.path().join("notes.txt");
    std::fs::write(&source, "hello from disk").unwrap();

    let mut config = Config::default();
    config.home = temp_dir.path().to_path_buf();
    config.server.api_key = "test-key".to_string();

    let (server, (to_client, mut from_client)) = InMemoryServer::new();
    let manager = Arc::new(LifecycleManager::with_connector(config, server));
    let running = manager.clone();
    let handle = tokio::spawn(async move { running.run().await });

    to_client
        .send(Inbound::Event {
            name: CONVERT_REQUEST.to_string(),
            data: json!({"id": "e2e", "source_path": source, "target_format": "text"}),
        })
        .unwrap();

    let mut progress = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match from_client.recv().await {
                Some(Outbound::Emit { event, data }) if event == PROGRESS_UPDATE => {
                    progress.push(data["progress"].as_u64().unwrap());
                }
                Some(Outbound::Emit { event, data }) if event == RESULT_UPDATE => break data,
                Some(other) => panic!("Unexpected outbound {:?}", other),
                None => panic!("Session closed before a result"),
            }
        }
    })
    .await
    .expect("No result forwarded to the server");

    assert_eq!(result["id"], "e2e");
    assert_eq!(result["success"], true);
    assert_eq!(result["result"]["output_text"], "hello from disk");
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert_eq!(progress.last(), Some(&100));

    manager.request_shutdown();
    let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("Lifecycle should shut down")
        .unwrap();
    assert!(outcome.is_ok());

    let mut rest = Vec::new();
    while let Some(outbound) = from_client.recv().await {
        rest.push(outbound);
    }
    assert!(rest.contains(&Outbound::Disconnect));
}
