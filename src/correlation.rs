//! Correlation id propagation.
//!
//! A correlation id is attached to every command at the boundary and copied
//! unchanged onto the events and dead letters produced while processing it.
//! The per-message [`MessageContext`] is an explicit value handed to handlers;
//! logging picks the id up from the context's span, not from global state.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::Span;
use uuid::Uuid;

use crate::message::{Headers, InboundMessage};

/// Header carrying the correlation id on every message.
pub const CORRELATION_HEADER: &str = "correlation_id";

/// Request header an HTTP boundary forwards as the correlation id.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Identifier threading one logical operation across services.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an existing id as-is. Blank values are rejected.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return None;
        }
        Some(Self(value))
    }

    /// Fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Read the id from message headers.
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        headers
            .get(CORRELATION_HEADER)
            .and_then(|v| Self::new(v.as_str()))
    }

    /// Boundary rule: forward the caller's request id, or mint one.
    ///
    /// Surrounding whitespace from the HTTP header is dropped here; ids read
    /// from message headers are never rewritten.
    pub fn from_request_header(request_id: Option<&str>) -> Self {
        request_id
            .map(str::trim)
            .and_then(Self::new)
            .unwrap_or_else(Self::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-message processing context.
///
/// Built once when a delivery is received; only `attempt` changes while the
/// retry middleware re-invokes the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    pub correlation_id: CorrelationId,
    pub message_id: String,
    pub subject: String,
    pub stream: String,
    /// 1-based handler invocation count within this delivery.
    pub attempt: u32,
    /// Broker delivery count for this message.
    pub delivered: u64,
}

impl MessageContext {
    /// Build the context for a received message.
    ///
    /// Returns `true` alongside the context when the message carried no
    /// correlation id and a fresh one was generated.
    pub fn from_message(message: &InboundMessage) -> (Self, bool) {
        let (correlation_id, generated) = match message.correlation_id() {
            Some(id) => (id, false),
            None => (CorrelationId::generate(), true),
        };
        let ctx = Self {
            correlation_id,
            message_id: message.message_id.clone(),
            subject: message.subject.clone(),
            stream: message.stream.clone(),
            attempt: 1,
            delivered: message.delivered,
        };
        (ctx, generated)
    }

    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// Span every log line of this message's processing is recorded under.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "command",
            subject = %self.subject,
            correlation_id = %self.correlation_id,
            message_id = %self.message_id,
            delivered = self.delivered,
        )
    }
}
