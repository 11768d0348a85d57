//! Event Bus - in-process publish/subscribe dispatcher
//!
//! One unbounded queue, one dispatch loop. Events are delivered in strict enqueue
//! order: the loop does not dequeue event N+1 until every handler for event N has
//! finished or failed. Handlers for the same event run concurrently on the loop
//! task and are fault-isolated from each other.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::event::{Event, SHUTDOWN, namespace_of};
use super::handler::{EventHandler, same_handler};

/// Default number of dispatched events kept for diagnostics
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// How long `stop` waits for the dispatch loop before aborting it
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Global wildcard pattern
pub const WILDCARD: &str = "*";

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded history capacity
    pub history_size: usize,

    /// Grace period for the dispatch loop on `stop`
    pub stop_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

type Registry = HashMap<String, Vec<Arc<dyn EventHandler>>>;

struct Inner {
    tx: mpsc::UnboundedSender<Event>,
    /// Held by the dispatch loop while it runs; survives an aborted loop so queued
    /// events are kept for the next `start`
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>>,
    handlers: RwLock<Registry>,
    history: Mutex<VecDeque<Event>>,
    config: BusConfig,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Central event bus
///
/// Cheap to clone; every clone refers to the same queue and registry. The owner
/// is expected to call [`EventBus::stop`]: the dispatch loop keeps the shared
/// state alive until then.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a bus with the given history capacity
    pub fn new(history_size: usize) -> Self {
        Self::with_config(BusConfig {
            history_size,
            ..BusConfig::default()
        })
    }

    pub fn with_config(config: BusConfig) -> Self {
        debug!(?config, "EventBus::with_config: called");
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                handlers: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(config.history_size)),
                config,
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Register a handler for an exact name, a `prefix:*` wildcard, or `*`
    ///
    /// Registering the same handler twice makes it run twice per event.
    pub fn subscribe(&self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) -> &Self {
        let pattern = pattern.into();
        debug!(%pattern, handler = handler.name(), "EventBus::subscribe: called");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(pattern)
            .or_default()
            .push(handler);
        self
    }

    /// Remove the first registration of `handler` under `pattern`
    ///
    /// Not finding it is not an error.
    pub fn unsubscribe(&self, pattern: &str, handler: &Arc<dyn EventHandler>) -> &Self {
        let mut registry = self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = registry.get_mut(pattern)
            && let Some(pos) = list.iter().position(|h| same_handler(h, handler))
        {
            list.remove(pos);
            if list.is_empty() {
                registry.remove(pattern);
            }
            debug!(%pattern, handler = handler.name(), "EventBus::unsubscribe: removed");
        }
        self
    }

    /// Enqueue an event; never blocks
    pub fn publish(&self, event: Event) {
        debug!(%event, "EventBus::publish");
        // The receiver lives in `inner`, so the channel cannot be closed here
        let _ = self.inner.tx.send(event);
    }

    /// Start the dispatch loop; a second call while running only warns
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            warn!("Event bus already running");
            return;
        }

        let handle = tokio::spawn(dispatch_loop(self.inner.clone()));
        *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("Event bus started");
    }

    /// Stop the dispatch loop
    ///
    /// Enqueues the shutdown sentinel and waits for the loop up to the configured
    /// timeout, then aborts it. A no-op when not running. Must not be awaited from
    /// inside a handler, since the loop would be waiting on itself.
    ///
    /// A loop stopped before it first ran leaves the sentinel queued; the next
    /// `start` records it in history and skips it.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            debug!("EventBus::stop: not running");
            return;
        }

        self.publish(Event::new(SHUTDOWN).with_source("EventBus"));

        let handle = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.inner.config.stop_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Dispatch loop ended abnormally"),
                Err(_) => {
                    warn!("Event bus shutdown timed out, cancelling...");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        info!("Event bus stopped");
    }

    /// Copy of the most recent dispatched events, oldest first
    pub fn history(&self) -> Vec<Event> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of registrations under exactly `pattern`
    pub fn handler_count(&self, pattern: &str) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pattern)
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_config(BusConfig::default())
    }
}

impl Inner {
    fn record(&self, event: &Event) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(event.clone());
        while history.len() > self.config.history_size {
            history.pop_front();
        }
    }

    /// Snapshot of the handlers for `name`: exact, then namespace wildcard, then global
    fn matching_handlers(&self, name: &str) -> Vec<Arc<dyn EventHandler>> {
        let registry = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched = Vec::new();

        if let Some(list) = registry.get(name) {
            matched.extend(list.iter().cloned());
        }

        if let Some(ns) = namespace_of(name) {
            let wildcard = format!("{}:*", ns);
            if wildcard != name
                && let Some(list) = registry.get(&wildcard)
            {
                matched.extend(list.iter().cloned());
            }
        }

        if name != WILDCARD
            && let Some(list) = registry.get(WILDCARD)
        {
            matched.extend(list.iter().cloned());
        }

        matched
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    debug!("dispatch_loop: called");
    let mut rx = inner.rx.clone().lock_owned().await;

    while inner.running.load(Ordering::Acquire) {
        let Some(event) = rx.recv().await else {
            debug!("dispatch_loop: queue closed");
            break;
        };

        inner.record(&event);

        if event.is_shutdown() {
            continue;
        }

        let handlers = inner.matching_handlers(event.name());
        if handlers.is_empty() {
            debug!(%event, "No handlers");
            continue;
        }

        join_all(handlers.iter().map(|handler| invoke(handler, &event))).await;
    }

    debug!("dispatch_loop: exiting");
}

async fn invoke(handler: &Arc<dyn EventHandler>, event: &Event) {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(handler = handler.name(), event = %event.name(), error = %e, "Handler error");
        }
        Err(panic) => {
            error!(
                handler = handler.name(),
                event = %event.name(),
                panic = panic_message(panic.as_ref()),
                "Handler panicked"
            );
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
