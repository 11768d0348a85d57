//! Process lifecycle
//!
//! Wires the bus, the socket service and the worker together, waits for a
//! termination signal and tears everything down in reverse order.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{BusConfig, EventBus, EventHandler};
use crate::transport::{
    Connector, FORWARDED_EVENTS, Keepalive, SocketConfig, SocketService, UpstreamForwarder, WsConnector,
};
use crate::worker::{DocConverterWorker, DocumentProcessor, LibreOfficeConverter, ProcessorConfig};

/// Grace period for each top-level task during shutdown
pub const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LifecycleManager {
    config: Config,
    connector: Arc<dyn Connector>,
    shutdown: CancellationToken,
}

impl LifecycleManager {
    /// Manager connecting over WebSocket to `server.url`
    pub fn new(config: Config) -> Result<Self> {
        let keepalive = Keepalive {
            ping_interval: config.server.ping_interval(),
            ping_timeout: config.server.ping_timeout(),
        };
        let connector = WsConnector::new(&config.server.url, keepalive)
            .with_context(|| format!("Invalid server url {}", config.server.url))?;
        Ok(Self::with_connector(config, Arc::new(connector)))
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        debug!("LifecycleManager::with_connector: called");
        Self {
            config,
            connector,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that ends `run` when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// Start every component, wait for a signal or shutdown request, then stop
    pub async fn run(&self) -> Result<()> {
        debug!("LifecycleManager::run: called");
        let config = &self.config;

        let bus = EventBus::with_config(BusConfig {
            history_size: config.bus.history_size,
            ..BusConfig::default()
        });
        let socket = Arc::new(SocketService::new(
            SocketConfig::from(&config.server),
            self.connector.clone(),
            bus.clone(),
        ));
        let processor = DocumentProcessor::new(ProcessorConfig {
            output_dir: config.output_dir(),
            conversion_timeout: Duration::from_secs(config.worker.conversion_timeout_secs),
            download_timeout: Duration::from_secs(config.worker.download_timeout_secs),
        })
        .context("Failed to build document processor")?
        .with_converter(Arc::new(LibreOfficeConverter::new(&config.worker.soffice_path)));
        let worker = DocConverterWorker::new(bus.clone(), processor);

        bus.start();
        worker.start();
        let forwarder: Arc<dyn EventHandler> = Arc::new(UpstreamForwarder::new(socket.clone()));
        bus.subscribe(FORWARDED_EVENTS, forwarder.clone());

        let runner = socket.clone();
        let tasks: Vec<(&str, JoinHandle<()>)> = vec![("socket", tokio::spawn(async move { runner.connect().await }))];
        info!(url = %config.server.url, "Client running");

        let waited = self.wait_for_shutdown().await;
        if let Err(e) = &waited {
            warn!(error = %e, "Stopping after startup failure");
        }

        info!("Shutting down...");
        socket.disconnect();
        for (name, mut handle) in tasks {
            match tokio::time::timeout(TASK_STOP_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "LifecycleManager::run: task finished"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, abandoning");
                    handle.abort();
                }
            }
        }
        worker.stop().await;
        bus.unsubscribe(FORWARDED_EVENTS, &forwarder);
        bus.stop().await;
        info!("Shutdown complete");

        waited
    }

    #[cfg(unix)]
    async fn wait_for_shutdown(&self) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigquit = signal(SignalKind::quit()).context("Failed to install SIGQUIT handler")?;

        tokio::select! {
            _ = self.shutdown.cancelled() => debug!("LifecycleManager::wait_for_shutdown: token cancelled"),
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
            _ = sigquit.recv() => warn!("SIGQUIT received"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn wait_for_shutdown(&self) -> Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => debug!("LifecycleManager::wait_for_shutdown: token cancelled"),
            received = tokio::signal::ctrl_c() => {
                received.context("Failed to listen for Ctrl-C")?;
                warn!("Ctrl-C received");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Auth, Session, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::TempDir;

    struct Refusing {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self, _auth: &Auth) -> Result<Session, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Rejected("bad key".to_string()))
        }
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.home = dir.path().to_path_buf();
        config
    }

    #[test]
    fn test_new_rejects_bad_url() {
        let mut config = Config::default();
        config.server.url = "not a url".to_string();
        assert!(LifecycleManager::new(config).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_token_ends_run() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(Refusing {
            attempts: AtomicUsize::new(0),
        });
        let manager = Arc::new(LifecycleManager::with_connector(config(&dir), connector.clone()));

        let running = manager.clone();
        let handle = tokio::spawn(async move { running.run().await });

        for _ in 0..500 {
            if connector.attempts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connector.attempts.load(Ordering::SeqCst) > 0);

        let started = Instant::now();
        manager.shutdown_token().cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        // the backoff sleep is woken, not waited out
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_shutdown_requested_before_run() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::with_connector(
            config(&dir),
            Arc::new(Refusing {
                attempts: AtomicUsize::new(0),
            }),
        );
        manager.request_shutdown();
        tokio::time::timeout(Duration::from_secs(5), manager.run())
            .await
            .unwrap()
            .unwrap();
    }
}
