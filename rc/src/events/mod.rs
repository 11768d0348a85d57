//! In-process event bus
//!
//! Components never call each other directly: the transport, the worker and the
//! upstream forwarder only share an [`EventBus`] handle and the event names below.

mod bus;
mod event;
mod handler;
mod payload;

pub use bus::{BusConfig, DEFAULT_HISTORY_SIZE, DEFAULT_STOP_TIMEOUT, EventBus, WILDCARD};
pub use event::{
    DOC_CANCEL, DOC_CANCELLED, DOC_CONVERT, DOC_PROGRESS, DOC_RESULT, Event, SERVER_MESSAGE, SHUTDOWN,
    SOCKET_CONNECTED, SOCKET_DISCONNECTED, SOCKET_ERROR, namespace_of,
};
pub use handler::{EventHandler, FnHandler, HandlerError, HandlerResult, handler_fn};
pub use payload::{EventKind, JobRef, PayloadError, SocketErrorPayload, deserialize_job_id, job_id_of};

pub(crate) use bus::panic_message;
