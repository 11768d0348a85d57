//! RAGFlow client - document conversion agent
//!
//! A long-running process that keeps one Socket.IO connection to a RAGFlow
//! server, turns server requests into events on an in-process bus, converts
//! documents locally and reports progress and results back.
//!
//! # Modules
//!
//! - [`events`] - Event type, payload schema and the event bus
//! - [`transport`] - Socket.IO client, reconnect loop and upstream forwarding
//! - [`worker`] - Conversion jobs, the document processor and the bus worker
//! - [`lifecycle`] - Component startup ordering and bounded shutdown
//! - [`config`] - Configuration types and loading
//! - [`daemon`] - Background process management
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod daemon;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, ServerConfig};
pub use daemon::{DaemonManager, DaemonStatus};
pub use events::{Event, EventBus, EventHandler, HandlerError, HandlerResult, PayloadError, handler_fn};
pub use lifecycle::LifecycleManager;
pub use transport::{ConnectionState, Connector, SocketService, TransportError, WsConnector};
pub use worker::{ConversionJob, DocConverterWorker, DocumentProcessor, JobError, JobProgress, JobResult, JobStatus};
