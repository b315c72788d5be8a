//! Wire envelope for commands, events and dead letters.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlation::{CorrelationId, CORRELATION_HEADER};
use crate::subject::StreamKind;

/// Header carrying the broker-level deduplication id.
pub const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

/// Message headers, ordered for stable logging.
pub type Headers = BTreeMap<String, String>;

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub stream: StreamKind,
    pub subject: String,
    pub headers: Headers,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(stream: StreamKind, subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            subject: subject.into(),
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    /// Build a message with a JSON-encoded body.
    pub fn json<T: Serialize + ?Sized>(
        stream: StreamKind,
        subject: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::new(stream, subject, payload))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_correlation(self, correlation_id: &CorrelationId) -> Self {
        self.with_header(CORRELATION_HEADER, correlation_id.as_str())
    }

    /// Set the deduplication id. Republishing the same id within the broker's
    /// duplicate window is acknowledged without being stored twice.
    pub fn with_message_id(self, message_id: impl Into<String>) -> Self {
        self.with_header(MESSAGE_ID_HEADER, message_id)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(MESSAGE_ID_HEADER).map(String::as_str)
    }

    /// Assign a random message id if none is set.
    pub fn ensure_message_id(mut self) -> Self {
        if !self.headers.contains_key(MESSAGE_ID_HEADER) {
            self.headers
                .insert(MESSAGE_ID_HEADER.to_string(), Uuid::new_v4().to_string());
        }
        self
    }
}

/// A message as handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Stream name as reported by the broker.
    pub stream: String,
    pub subject: String,
    /// Publisher-assigned id, or the stream sequence when absent.
    pub message_id: String,
    pub headers: Headers,
    pub payload: Bytes,
    /// Delivery count, starting at 1.
    pub delivered: u64,
}

impl InboundMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        CorrelationId::from_headers(&self.headers)
    }
}

/// Broker confirmation of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    /// The broker already held a message with the same id.
    pub duplicate: bool,
}

/// Body of an `Update*` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCommand<P> {
    pub id: Uuid,
    pub data: P,
}

/// Body of an `<Entity>Deleted` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDeleted {
    pub id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

/// Decode the body of a `Delete*` command.
///
/// Accepts a JSON string (`"8c1f..."`) or the bare UUID text.
pub fn decode_entity_id(payload: &[u8]) -> Result<Uuid, String> {
    if let Ok(id) = serde_json::from_slice::<Uuid>(payload) {
        return Ok(id);
    }
    let text = std::str::from_utf8(payload).map_err(|e| e.to_string())?;
    Uuid::parse_str(text.trim()).map_err(|e| e.to_string())
}
