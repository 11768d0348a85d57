//! Event record flowing through the bus

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::payload::PayloadError;

/// Reserved sentinel used by `EventBus::stop` to unblock the dispatch loop
pub const SHUTDOWN: &str = "sys:shutdown";

pub const DOC_CONVERT: &str = "doc:convert";
pub const DOC_CANCEL: &str = "doc:cancel";
pub const DOC_PROGRESS: &str = "doc:progress";
pub const DOC_RESULT: &str = "doc:result";
pub const DOC_CANCELLED: &str = "doc:cancelled";

pub const SOCKET_CONNECTED: &str = "socket:connected";
pub const SOCKET_DISCONNECTED: &str = "socket:disconnected";
pub const SOCKET_ERROR: &str = "socket:error";

pub const SERVER_MESSAGE: &str = "server:message";

/// An immutable, named, timestamped record
///
/// Fields are private: once built an event can only be read. Handlers receive
/// `&Event`, so a payload shared between several handlers cannot be changed
/// underneath them.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    name: String,
    payload: Value,
    id: Uuid,
    timestamp: DateTime<Utc>,
    source: String,
}

impl Event {
    /// Create an event with an empty payload
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            source: String::new(),
        }
    }

    /// Attach a payload
    ///
    /// A value that fails to serialize becomes `null`; consumers validate payloads
    /// anyway, so the event still flows and fails at the consumer boundary.
    pub fn with_payload(mut self, payload: impl Serialize) -> Self {
        self.payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(event = %self.name, error = %e, "Event::with_payload: payload not serializable");
                Value::Null
            }
        };
        self
    }

    /// Tag the event with its origin
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Namespace portion of the name (text before the first `:`)
    pub fn namespace(&self) -> Option<&str> {
        namespace_of(&self.name)
    }

    /// Decode the payload into its typed form
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| PayloadError::Invalid {
            event: self.name.clone(),
            source,
        })
    }

    /// Whether this is the reserved shutdown sentinel
    pub fn is_shutdown(&self) -> bool {
        self.name == SHUTDOWN
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.simple().to_string();
        let source = if self.source.is_empty() { "unknown" } else { &self.source };
        write!(f, "Event({}, id={}, source={})", self.name, &id[..8], source)
    }
}

/// Namespace of an event name, if it has one
pub fn namespace_of(name: &str) -> Option<&str> {
    name.split_once(':').map(|(ns, _)| ns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_new_event_defaults() {
        let event = Event::new("doc:convert");
        assert_eq!(event.name(), "doc:convert");
        assert_eq!(event.payload(), &Value::Null);
        assert_eq!(event.source(), "");
        assert!(!event.is_shutdown());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Event::new("a:b");
        let b = Event::new("a:b");
        assert_ne!(a.id(), b.id());
        assert!(a.timestamp() <= b.timestamp());
    }

    #[test]
    fn test_namespace() {
        assert_eq!(Event::new("doc:convert").namespace(), Some("doc"));
        assert_eq!(Event::new("doc:convert:request").namespace(), Some("doc"));
        assert_eq!(Event::new("plain").namespace(), None);
    }

    #[test]
    fn test_decode_typed_payload() {
        #[derive(Debug, Deserialize)]
        struct Cancel {
            id: String,
        }

        let event = Event::new(DOC_CANCEL).with_payload(json!({"id": "job-1"}));
        let cancel: Cancel = event.decode().unwrap();
        assert_eq!(cancel.id, "job-1");

        let bad = Event::new(DOC_CANCEL).with_payload(json!({"nope": 1}));
        let err = bad.decode::<Cancel>().unwrap_err();
        assert!(err.to_string().contains("doc:cancel"));
    }

    #[test]
    fn test_display_uses_short_id() {
        let event = Event::new("doc:result").with_source("Worker");
        let shown = event.to_string();
        assert!(shown.starts_with("Event(doc:result, id="));
        assert!(shown.ends_with("source=Worker)"));

        let anonymous = Event::new("x:y").to_string();
        assert!(anonymous.ends_with("source=unknown)"));
    }

    #[test]
    fn test_shutdown_sentinel() {
        assert!(Event::new(SHUTDOWN).is_shutdown());
    }
}
