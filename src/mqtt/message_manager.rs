use super::error::MqttError;
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::warn;

/// Outgoing message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl Payload {
    pub fn try_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, MqttError> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Serializes `value` as JSON. Values that fail to encode become an empty payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Self {
        Self::try_json(value).unwrap_or_else(|e| {
            warn!("Payload not encodable, sending empty payload: {}", e);
            Payload::Empty
        })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Empty => Vec::new(),
            Payload::Text(text) => text.into_bytes(),
            Payload::Bytes(bytes) => bytes,
            // plain strings go out unquoted, everything else as JSON text
            Payload::Json(Value::String(text)) => text.into_bytes(),
            Payload::Json(value) => serde_json::to_vec(&value).unwrap_or_default(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(payload: Option<T>) -> Self {
        payload.map(Into::into).unwrap_or_default()
    }
}

/// A message handed to a subscription callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivedMessage {
    pub topic: String,
    /// `topic` without the leading `<basetopic>/`
    pub relative_topic: String,
    /// Decoded JSON if the payload parsed, the payload string otherwise
    pub payload: Value,
    pub received_at: NaiveDateTime,
}

impl ArrivedMessage {
    pub fn decode(topic: &str, relative_topic: &str, raw: &[u8]) -> Self {
        ArrivedMessage {
            topic: topic.to_string(),
            relative_topic: relative_topic.to_string(),
            payload: decode_payload(raw),
            received_at: chrono::Local::now().naive_local(),
        }
    }

    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_str()
    }
}

impl fmt::Display for ArrivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = match &self.payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let preview: String = content.chars().take(40).collect();
        write!(f, "{} - {}: {}", self.received_at, self.topic, preview)
    }
}

fn decode_payload(raw: &[u8]) -> Value {
    let text = String::from_utf8_lossy(raw);
    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned()))
}
