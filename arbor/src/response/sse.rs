//! Defines the server-sent-events surface of the response controller.

use bytes::Bytes;
use serde_json::Value;

use crate::response::ResponseHandle;

/// Options for [`ResponseHandle::sse`](crate::response::ResponseHandle::sse).
#[derive(Clone, Debug, Default)]
pub struct SseOptions {
    /// Reconnection delay advertised to the client, in milliseconds. Emitted
    /// as a `retry:` field before the first event.
    pub retry: Option<u64>,
    /// When set, the stream is not auto-closed when the handler returns; the
    /// handler (or a background task) closes it explicitly.
    pub keep_open: bool,
}

/// Optional fields attached to a single event.
#[derive(Clone, Debug, Default)]
pub struct SseEvent {
    /// The `event:` name field.
    pub event: Option<String>,
    /// The `id:` field.
    pub id: Option<String>,
}

impl SseEvent {
    /// An event with a name and no id.
    pub fn named<S: Into<String>>(event: S) -> SseEvent {
        SseEvent {
            event: Some(event.into()),
            id: None,
        }
    }

    /// Attaches an `id:` field.
    pub fn with_id<S: Into<String>>(mut self, id: S) -> SseEvent {
        self.id = Some(id.into());
        self
    }
}

/// A handle for emitting server-sent events on an open SSE stream.
pub struct SseHandle {
    pub(crate) response: ResponseHandle,
}

impl SseHandle {
    /// Emits a bare `data:` event.
    pub fn send(&self, data: Value) {
        self.send_event(data, SseEvent::default());
    }

    /// Emits an event with the given fields. Strings are sent verbatim, any
    /// other JSON value is serialized; each event terminates with a blank
    /// line per the SSE framing rules.
    pub fn send_event(&self, data: Value, fields: SseEvent) {
        self.response.write_chunk(Bytes::from(format_event(&data, &fields)));
    }

    /// Closes the stream.
    pub fn close(&self) {
        self.response.close_stream();
    }
}

fn format_event(data: &Value, fields: &SseEvent) -> String {
    let mut out = String::new();

    if let Some(event) = &fields.event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    if let Some(id) = &fields.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }

    let payload = match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    for line in payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }

    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn formats_named_events() {
        let text = format_event(&json!({"tick": 1}), &SseEvent::named("ticks"));
        assert_eq!(text, "event: ticks\ndata: {\"tick\":1}\n\n");
    }

    #[test]
    fn formats_ids_and_multiline_data() {
        let text = format_event(
            &Value::String("a\nb".into()),
            &SseEvent::named("log").with_id("7"),
        );
        assert_eq!(text, "event: log\nid: 7\ndata: a\ndata: b\n\n");
    }

    #[test]
    fn bare_events_have_only_data() {
        let text = format_event(&Value::String("ping".into()), &SseEvent::default());
        assert_eq!(text, "data: ping\n\n");
    }
}
