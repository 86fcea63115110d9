//! Broker topic table, payload decoding and the dashboard wire format.
//!
//! Inbound (broker → pipeline):
//! ```text
//! ┌──────────────────┬────────────────────────────────────┬──────────────┐
//! │ topic            │ payload                            │ decoded as   │
//! ├──────────────────┼────────────────────────────────────┼──────────────┤
//! │ live_feed        │ opaque bytes (base64 JPEG text)    │ Event::Live  │
//! │ alerts/face      │ JSON {timestamp, objects, image}   │ Event::Face  │
//! │ alerts/object    │ JSON {timestamp, objects, image}   │ Event::Object│
//! │ alerts/gesture   │ JSON {timestamp, objects, message} │ Event::Gesture│
//! │ alerts/voice     │ JSON {timestamp, objects, message} │ Event::Voice │
//! │ ai_alerts        │ JSON (deprecated merged topic)     │ LegacyAlert  │
//! └──────────────────┴────────────────────────────────────┴──────────────┘
//! ```
//!
//! Outbound (broadcaster → dashboard), one WebSocket text frame per event:
//! ```text
//! {"event": "live_feed" | "alert" | "new_alert", "data": <payload>}
//! ```

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

/// Rendered in place of an empty detection list.
pub const UNKNOWN_OBJECT: &str = "Unknown Object";

/// Broker topics the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    LiveFeed,
    /// Deprecated single-topic alert scheme.
    LegacyAlerts,
    FaceAlerts,
    ObjectAlerts,
    GestureAlerts,
    VoiceAlerts,
}

/// Fixed topic name table. Dispatch is by exact match.
const TOPIC_TABLE: &[(&str, Topic)] = &[
    ("live_feed", Topic::LiveFeed),
    ("ai_alerts", Topic::LegacyAlerts),
    ("alerts/face", Topic::FaceAlerts),
    ("alerts/object", Topic::ObjectAlerts),
    ("alerts/gesture", Topic::GestureAlerts),
    ("alerts/voice", Topic::VoiceAlerts),
];

impl Topic {
    /// Every topic, in table order.
    pub const ALL: [Topic; 6] = [
        Topic::LiveFeed,
        Topic::LegacyAlerts,
        Topic::FaceAlerts,
        Topic::ObjectAlerts,
        Topic::GestureAlerts,
        Topic::VoiceAlerts,
    ];

    /// Look up a topic by its exact broker name.
    pub fn from_name(name: &str) -> Option<Self> {
        TOPIC_TABLE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| *t)
    }

    /// Broker name of this topic.
    pub fn name(self) -> &'static str {
        TOPIC_TABLE
            .iter()
            .find(|(_, t)| *t == self)
            .map(|(n, _)| *n)
            .unwrap_or("")
    }

    /// Topics to subscribe to. The legacy topic is opt-in.
    pub fn subscriptions(include_legacy: bool) -> Vec<Topic> {
        Self::ALL
            .iter()
            .copied()
            .filter(|t| include_legacy || *t != Topic::LegacyAlerts)
            .collect()
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a persisted alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Face,
    Object,
    Gesture,
    Voice,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Face => "face",
            AlertKind::Object => "object",
            AlertKind::Gesture => "gesture",
            AlertKind::Voice => "voice",
        }
    }
}

/// Transient camera frame. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveFrame {
    /// Receipt time, seconds since epoch (the topic carries no timestamp)
    pub timestamp: i64,
    /// Encoded image transport bytes, passed through untouched
    pub image: Bytes,
}

impl LiveFrame {
    /// Text form forwarded to sessions.
    ///
    /// Producers publish base64 JPEG text, which is forwarded verbatim.
    /// Anything that is not UTF-8 is base64-encoded first.
    pub fn transport_text(&self) -> String {
        match std::str::from_utf8(&self.image) {
            Ok(text) => text.to_string(),
            Err(_) => base64::engine::general_purpose::STANDARD.encode(&self.image),
        }
    }
}

/// A decoded alert record, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertPayload {
    /// Producer-supplied timestamp, seconds since epoch
    pub timestamp: i64,
    /// Detected entities, in producer order (may be empty)
    pub objects: Vec<String>,
    /// Optional detector message ("Unrecognized face detected")
    pub message: Option<String>,
    /// Decoded snapshot image bytes
    pub image: Option<Vec<u8>>,
}

/// Closed set of decoded broker events.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Live(LiveFrame),
    Face(AlertPayload),
    Object(AlertPayload),
    Gesture(AlertPayload),
    Voice(AlertPayload),
    /// Alert from the deprecated merged `ai_alerts` topic.
    LegacyAlert(AlertPayload),
}

impl Event {
    /// Kind and payload for alert events; `None` for live frames.
    pub fn alert(&self) -> Option<(AlertKind, &AlertPayload)> {
        match self {
            Event::Live(_) => None,
            Event::Face(p) => Some((AlertKind::Face, p)),
            Event::Object(p) => Some((AlertKind::Object, p)),
            Event::Gesture(p) => Some((AlertKind::Gesture, p)),
            Event::Voice(p) => Some((AlertKind::Voice, p)),
            // The merged topic was fed by the object detector.
            Event::LegacyAlert(p) => Some((AlertKind::Object, p)),
        }
    }
}

/// Per-message decode failures. The caller logs and discards.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("empty payload")]
    EmptyPayload,
    #[error("malformed alert JSON: {0}")]
    InvalidJson(String),
    #[error("alert is missing the timestamp field")]
    MissingTimestamp,
    #[error("alert timestamp is not an integer: {0}")]
    InvalidTimestamp(String),
    #[error("alert image is not valid base64: {0}")]
    InvalidImage(String),
}

#[derive(Deserialize)]
struct RawAlert {
    timestamp: Option<serde_json::Value>,
    objects: Option<Vec<String>>,
    image: Option<String>,
    message: Option<String>,
}

/// Decode one broker message.
pub fn decode(topic: &str, payload: &[u8]) -> Result<Event, DecodeError> {
    let topic = Topic::from_name(topic).ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;
    decode_topic(topic, payload)
}

/// Decode a message whose topic has already been resolved.
pub fn decode_topic(topic: Topic, payload: &[u8]) -> Result<Event, DecodeError> {
    match topic {
        Topic::LiveFeed => decode_live(payload).map(Event::Live),
        Topic::LegacyAlerts => decode_alert(payload).map(Event::LegacyAlert),
        Topic::FaceAlerts => decode_alert(payload).map(Event::Face),
        Topic::ObjectAlerts => decode_alert(payload).map(Event::Object),
        Topic::GestureAlerts => decode_alert(payload).map(Event::Gesture),
        Topic::VoiceAlerts => decode_alert(payload).map(Event::Voice),
    }
}

fn decode_live(payload: &[u8]) -> Result<LiveFrame, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    Ok(LiveFrame {
        timestamp,
        image: Bytes::copy_from_slice(payload),
    })
}

fn decode_alert(payload: &[u8]) -> Result<AlertPayload, DecodeError> {
    let raw: RawAlert =
        serde_json::from_slice(payload).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let timestamp = match raw.timestamp {
        None | Some(serde_json::Value::Null) => return Err(DecodeError::MissingTimestamp),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| DecodeError::InvalidTimestamp(n.to_string()))?,
        Some(other) => return Err(DecodeError::InvalidTimestamp(other.to_string())),
    };

    let image = match raw.image.as_deref() {
        None | Some("") => None,
        Some(encoded) => Some(decode_image(encoded)?),
    };

    Ok(AlertPayload {
        timestamp,
        objects: raw.objects.unwrap_or_default(),
        message: raw.message.filter(|m| !m.is_empty()),
        image,
    })
}

fn decode_image(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    // Accept `data:image/jpeg;base64,...` as well as bare base64.
    let body = match encoded.split_once(";base64,") {
        Some((prefix, body)) if prefix.starts_with("data:") => body,
        _ => encoded,
    };
    base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| DecodeError::InvalidImage(e.to_string()))
}

/// Presentation form of a detection list.
pub fn render_objects(objects: &[String]) -> String {
    if objects.is_empty() {
        UNKNOWN_OBJECT.to_string()
    } else {
        objects.join(", ")
    }
}

/// Names of the events pushed to dashboard sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "live_feed")]
    LiveFeed,
    #[serde(rename = "alert")]
    Alert,
    /// Legacy alert notification (merged topic).
    #[serde(rename = "new_alert")]
    NewAlert,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::LiveFeed => "live_feed",
            EventName::Alert => "alert",
            EventName::NewAlert => "new_alert",
        }
    }
}

/// One event pushed to every active session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEvent {
    pub event: EventName,
    pub data: serde_json::Value,
}

impl OutboundEvent {
    pub fn new(event: EventName, data: serde_json::Value) -> Self {
        Self { event, data }
    }

    /// Forwarded live frame.
    pub fn live_feed(frame: &LiveFrame) -> Self {
        Self::new(EventName::LiveFeed, serde_json::Value::String(frame.transport_text()))
    }

    /// Serialize to the text wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame (used by clients and tests).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Wire format errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
