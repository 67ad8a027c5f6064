//! Wire messages exchanged with the collector.
//!
//! On the wire a message is a flat JSON object
//! `{id, type, data, timestamp, sessionId, visitorId, priority, retry}`.
//! In memory `type` and `data` become one [`Payload`] union; unknown types
//! are kept as [`Payload::Opaque`] so newer collectors don't break older
//! clients.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Delivery attempts before a queued message is dropped.
    pub fn retry_budget(&self) -> u32 {
        match self {
            Priority::Critical => 5,
            _ => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Set when acknowledging a heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Event(EventPayload),
    Heartbeat(HeartbeatPayload),
    Ack(AckPayload),
    Error(ErrorPayload),
    Command(CommandPayload),
    /// A type this client doesn't know, kept verbatim.
    Opaque { kind: String, data: Value },
}

impl Payload {
    pub fn event(name: impl Into<String>, properties: Option<Value>) -> Self {
        Payload::Event(EventPayload {
            name: name.into(),
            properties: properties.unwrap_or(Value::Null),
        })
    }

    /// The wire `type`.
    pub fn message_type(&self) -> &str {
        match self {
            Payload::Event(_) => "event",
            Payload::Heartbeat(_) => "heartbeat",
            Payload::Ack(_) => "ack",
            Payload::Error(_) => "error",
            Payload::Command(_) => "command",
            Payload::Opaque { kind, .. } => kind.as_str(),
        }
    }

    fn from_parts(kind: String, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind.as_str() {
            "event" => Payload::Event(serde_json::from_value(data)?),
            "heartbeat" => Payload::Heartbeat(decode_or_default(data)?),
            "ack" => Payload::Ack(decode_or_default(data)?),
            "error" => Payload::Error(decode_or_default(data)?),
            "command" => Payload::Command(serde_json::from_value(data)?),
            _ => Payload::Opaque { kind, data },
        })
    }

    fn into_parts(self) -> (String, Value) {
        let kind = self.message_type().to_string();
        let data = match self {
            Payload::Event(p) => serde_json::to_value(p),
            Payload::Heartbeat(p) => serde_json::to_value(p),
            Payload::Ack(p) => serde_json::to_value(p),
            Payload::Error(p) => serde_json::to_value(p),
            Payload::Command(p) => serde_json::to_value(p),
            Payload::Opaque { data, .. } => Ok(data),
        };
        (kind, data.unwrap_or(Value::Null))
    }
}

fn decode_or_default<T: DeserializeOwned + Default>(data: Value) -> Result<T, serde_json::Error> {
    if data.is_null() {
        Ok(T::default())
    } else {
        serde_json::from_value(data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWireMessage", into = "RawWireMessage")]
pub struct WireMessage {
    pub id: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub visitor_id: Option<String>,
    pub priority: Priority,
    /// Set when this frame redelivers a message whose earlier write failed.
    /// Attempt counts stay on the client's queue entry.
    pub retry: bool,
}

impl WireMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Ping id this message answers, if it is a heartbeat reply.
    ///
    /// Replies either carry `pingId` in `data` or reuse the ping's message id.
    pub fn ping_reference(&self) -> Option<&str> {
        match &self.payload {
            Payload::Heartbeat(hb) => Some(hb.ping_id.as_deref().unwrap_or(&self.id)),
            Payload::Ack(ack) => ack.ping_id.as_deref(),
            _ => None,
        }
    }
}

/// Flat wire shape. Inbound frames may omit everything but `type`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWireMessage {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    visitor_id: Option<String>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    retry: bool,
}

impl TryFrom<RawWireMessage> for WireMessage {
    type Error = serde_json::Error;

    fn try_from(raw: RawWireMessage) -> Result<Self, Self::Error> {
        let timestamp = raw
            .timestamp
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        Ok(WireMessage {
            id: raw.id,
            payload: Payload::from_parts(raw.kind, raw.data)?,
            timestamp,
            session_id: raw.session_id,
            visitor_id: raw.visitor_id,
            priority: raw.priority,
            retry: raw.retry,
        })
    }
}

impl From<WireMessage> for RawWireMessage {
    fn from(message: WireMessage) -> Self {
        let (kind, data) = message.payload.into_parts();
        RawWireMessage {
            id: message.id,
            kind,
            data,
            timestamp: Some(message.timestamp.timestamp_millis()),
            session_id: message.session_id,
            visitor_id: message.visitor_id,
            priority: message.priority,
            retry: message.retry,
        }
    }
}

/// What callers hand to `send`; the manager stamps the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub payload: Payload,
    pub priority: Priority,
}

impl OutboundMessage {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            priority: Priority::default(),
        }
    }

    pub fn event(name: impl Into<String>, properties: Option<Value>) -> Self {
        Self::new(Payload::event(name, properties))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl From<Payload> for OutboundMessage {
    fn from(payload: Payload) -> Self {
        Self::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn event_wire_shape() {
        let message = WireMessage {
            id: "m-1".into(),
            payload: Payload::event("click", Some(json!({"x": 1}))),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            session_id: Some("s-1".into()),
            visitor_id: Some("v-1".into()),
            priority: Priority::High,
            retry: false,
        };

        let json: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({
                "id": "m-1",
                "type": "event",
                "data": {"name": "click", "properties": {"x": 1}},
                "timestamp": 1_700_000_000_000i64,
                "sessionId": "s-1",
                "visitorId": "v-1",
                "priority": "high",
                "retry": false
            })
        );
    }

    #[test]
    fn unknown_type_is_opaque() {
        let message = WireMessage::decode(r#"{"id":"x","type":"config","data":{"rate":5}}"#).unwrap();
        assert_eq!(
            message.payload,
            Payload::Opaque {
                kind: "config".into(),
                data: json!({"rate": 5})
            }
        );
        assert_eq!(message.payload.message_type(), "config");

        // Opaque survives re-encoding
        let again: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(again["type"], "config");
        assert_eq!(again["data"]["rate"], 5);
    }

    #[test]
    fn sparse_inbound_frames_decode() {
        let message = WireMessage::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(message.priority, Priority::Normal);
        assert!(!message.retry);
        assert_eq!(message.payload, Payload::Heartbeat(HeartbeatPayload::default()));
    }

    #[test]
    fn ping_reference_prefers_ping_id() {
        let reply = WireMessage::decode(r#"{"id":"r","type":"heartbeat","data":{"pingId":"p-1"}}"#).unwrap();
        assert_eq!(reply.ping_reference(), Some("p-1"));

        let echoed = WireMessage::decode(r#"{"id":"p-2","type":"heartbeat"}"#).unwrap();
        assert_eq!(echoed.ping_reference(), Some("p-2"));

        let ack = WireMessage::decode(r#"{"id":"a","type":"ack","data":{"messageId":"m"}}"#).unwrap();
        assert_eq!(ack.ping_reference(), None);
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(WireMessage::decode("not json").is_err());
        assert!(WireMessage::decode(r#"{"id":"x"}"#).is_err());
        // An event without a name
        assert!(WireMessage::decode(r#"{"type":"event","data":{}}"#).is_err());
    }

    #[test]
    fn retry_budget_by_priority() {
        assert_eq!(Priority::Critical.retry_budget(), 5);
        assert_eq!(Priority::High.retry_budget(), 3);
        assert_eq!(Priority::Low.retry_budget(), 3);
        assert_eq!("critical".parse::<Priority>(), Ok(Priority::Critical));
    }
}
