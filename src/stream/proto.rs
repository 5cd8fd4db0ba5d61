use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Path served by the stream endpoint.
pub const STREAM_PATH: &str = "/websock";
/// Marker sent after the last filter to close the filter list.
pub const END_OF_FILTERS: &str = "EOF";
/// Keepalive payload pushed by the server to idle clients.
pub const PING_EVENT: &str = r#"{"Ping": null}"#;

const PING_KEY: &str = "Ping";
const EVENT_NAME_HEADER: &str = "Event-Name";
const UNIQUE_ID_HEADER: &str = "Unique-ID";

/// Returns the handshake messages for `filters`, in send order.
///
/// Every filter is yielded unchanged followed by [`END_OF_FILTERS`].
pub fn handshake_messages(filters: &[String]) -> impl Iterator<Item = &str> {
    filters
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(END_OF_FILTERS))
}

/// Header map of one streamed event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct EventHeaders(BTreeMap<String, Value>);

impl EventHeaders {
    /// Returns a header value when present and textual.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Returns the raw JSON value of a header.
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn event_name(&self) -> Option<&str> {
        self.get(EVENT_NAME_HEADER)
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.get(UNIQUE_ID_HEADER)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl FromIterator<(String, Value)> for EventHeaders {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Decoded stream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Server keepalive.
    Ping,
    /// Regular event with its headers.
    Event(EventHeaders),
}

/// Decodes a raw stream payload.
///
/// Malformed JSON and non-object payloads yield `None`; decode failures are
/// logged and never propagated.
pub fn parse_event(payload: &str) -> Option<ServerEvent> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            debug!(event = "event_decode_failed", error = %err);
            return None;
        }
    };

    let Value::Object(fields) = value else {
        debug!(event = "event_not_an_object");
        return None;
    };

    if fields.len() == 1 && fields.get(PING_KEY).is_some_and(Value::is_null) {
        return Some(ServerEvent::Ping);
    }

    Some(ServerEvent::Event(fields.into_iter().collect()))
}
