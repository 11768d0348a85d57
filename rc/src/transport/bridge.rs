//! Remote event names and the inbound mapping onto bus events

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::events::{DOC_CANCEL, DOC_CONVERT, Event, SERVER_MESSAGE, job_id_of};

/// Generic server notification; `data.type` picks the bus name
pub const NOTIFICATION: &str = "notification";
pub const CONVERT_REQUEST: &str = "doc:convert:request";
pub const CANCEL_REQUEST: &str = "doc:cancel:request";
pub const MESSAGE: &str = "message";

pub const PROGRESS_UPDATE: &str = "doc:convert:progress";
pub const RESULT_UPDATE: &str = "doc:convert:result";
pub const CANCELLED_UPDATE: &str = "doc:convert:cancelled";

/// Source tag on every bridged event
pub const SOURCE: &str = "SocketService";

/// Bus event for a remote event; every remote event maps to something
pub fn inbound_event(name: &str, data: Value) -> Event {
    let event = match name {
        NOTIFICATION => {
            let kind = data.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string();
            debug!(%kind, "Received notification");
            Event::new(format!("server:{}", kind)).with_payload(data)
        }
        CONVERT_REQUEST => {
            info!(
                job_id = job_id_of(&data).as_deref().unwrap_or("unknown"),
                "Received document conversion request"
            );
            Event::new(DOC_CONVERT).with_payload(data)
        }
        CANCEL_REQUEST => {
            info!(
                job_id = job_id_of(&data).as_deref().unwrap_or("unknown"),
                "Received cancellation request"
            );
            Event::new(DOC_CANCEL).with_payload(data)
        }
        MESSAGE => {
            let payload = if data.is_object() { data } else { json!({ "data": data }) };
            Event::new(SERVER_MESSAGE).with_payload(payload)
        }
        other => {
            debug!(event = %other, "Forwarding unrecognized server event");
            Event::new(SERVER_MESSAGE).with_payload(json!({ "event": other, "data": data }))
        }
    };
    event.with_source(SOURCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_uses_type() {
        let event = inbound_event(NOTIFICATION, json!({"type": "convert", "x": 1}));
        assert_eq!(event.name(), "server:convert");
        assert_eq!(event.payload()["x"], 1);
        assert_eq!(event.source(), SOURCE);
    }

    #[test]
    fn test_notification_without_type() {
        assert_eq!(inbound_event(NOTIFICATION, json!({"x": 1})).name(), "server:unknown");
        assert_eq!(inbound_event(NOTIFICATION, json!({"type": 3})).name(), "server:unknown");
        assert_eq!(inbound_event(NOTIFICATION, json!("text")).name(), "server:unknown");
    }

    #[test]
    fn test_convert_and_cancel_requests() {
        let convert = inbound_event(CONVERT_REQUEST, json!({"id": "j1", "source_path": "a.docx"}));
        assert_eq!(convert.name(), DOC_CONVERT);
        assert_eq!(convert.payload()["source_path"], "a.docx");

        let cancel = inbound_event(CANCEL_REQUEST, json!({"id": "j1"}));
        assert_eq!(cancel.name(), DOC_CANCEL);
    }

    #[test]
    fn test_message_wraps_non_objects() {
        let text = inbound_event(MESSAGE, json!("hello"));
        assert_eq!(text.name(), SERVER_MESSAGE);
        assert_eq!(text.payload(), &json!({"data": "hello"}));

        let object = inbound_event(MESSAGE, json!({"k": "v"}));
        assert_eq!(object.payload(), &json!({"k": "v"}));
    }

    #[test]
    fn test_unknown_event_is_not_dropped() {
        let event = inbound_event("whatever", json!([1, 2]));
        assert_eq!(event.name(), SERVER_MESSAGE);
        assert_eq!(event.payload(), &json!({"event": "whatever", "data": [1, 2]}));
    }
}
