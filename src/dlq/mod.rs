//! Dead Letter Queue (DLQ) infrastructure.
//!
//! Provides a trait-based abstraction for publishing commands whose retries
//! are exhausted, for manual review and replay.
//!
//! ## Subject Naming
//!
//! Dead letters live on the `dlq` stream under `dlq.<original subject>`, so
//! `cmd.projects.CreateProject` dead-letters to
//! `dlq.cmd.projects.CreateProject` and an operator can filter by service or
//! command.
//!
//! ## Message Format
//!
//! A JSON [`DeadLetter`] document carrying the original subject, the failure
//! details of the last attempt and the decoded payload. The correlation id
//! travels both in the body and in the message header.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::Broker;
use crate::correlation::{CorrelationId, MessageContext};
use crate::handler::HandlerError;
use crate::message::{InboundMessage, OutboundMessage};
use crate::subject::{dlq_subject, StreamKind};
use crate::utils::backoff::{publish_backoff, publish_with_retry};

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("DLQ not configured")]
    NotConfigured,

    #[error("Failed to serialize dead letter: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),
}

/// A command whose retries are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_stream: String,
    pub original_subject: String,
    pub message_id: String,
    pub correlation_id: CorrelationId,
    pub attempt_count: u32,
    pub exception_type: String,
    pub exception_message: String,
    pub exception_traceback: String,
    /// The payload as JSON, or as a lossy UTF-8 string if it was not JSON.
    pub decoded_payload: Value,
    /// How `decoded_payload` maps back to the original bytes.
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Record the final failure of `message` after `attempts` invocations.
    pub fn from_failure(
        ctx: &MessageContext,
        message: &InboundMessage,
        attempts: u32,
        error: &HandlerError,
    ) -> Self {
        let (decoded_payload, payload_encoding) = decode_payload(&message.payload);
        Self {
            original_stream: message.stream.clone(),
            original_subject: message.subject.clone(),
            message_id: message.message_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            attempt_count: attempts,
            exception_type: error.type_name().to_string(),
            exception_message: error.to_string(),
            exception_traceback: error.trace(),
            decoded_payload,
            payload_encoding,
            failed_at: Utc::now(),
        }
    }

    pub fn subject(&self) -> String {
        dlq_subject(&self.original_subject)
    }

    /// The message published to the `dlq` stream. Its id derives from the
    /// original message id so a redelivered failure is stored once.
    pub fn to_outbound(&self) -> Result<OutboundMessage, DlqError> {
        Ok(OutboundMessage::json(StreamKind::Dlq, self.subject(), self)?
            .with_correlation(&self.correlation_id)
            .with_message_id(format!("dlq-{}", self.message_id)))
    }

    /// Rebuild the original command for replay: same subject, same payload,
    /// same correlation id, fresh message id.
    pub fn replay_message(&self) -> OutboundMessage {
        let payload = match (self.payload_encoding, &self.decoded_payload) {
            (PayloadEncoding::Text, Value::String(raw)) => Bytes::from(raw.clone()),
            (_, value) => Bytes::from(value.to_string()),
        };
        OutboundMessage::new(StreamKind::Cmd, self.original_subject.clone(), payload)
            .with_correlation(&self.correlation_id)
            .with_message_id(Uuid::new_v4().to_string())
    }
}

/// Whether a dead letter's payload was stored as parsed JSON or as raw text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Json,
    Text,
}

fn decode_payload(payload: &[u8]) -> (Value, PayloadEncoding) {
    match serde_json::from_slice(payload) {
        Ok(value) => (value, PayloadEncoding::Json),
        Err(_) => (
            Value::String(String::from_utf8_lossy(payload).into_owned()),
            PayloadEncoding::Text,
        ),
    }
}

/// Trait for DLQ publishers.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Whether dead letters actually go anywhere.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Publishes dead letters to the broker's `dlq` stream.
pub struct BrokerDeadLetterPublisher {
    broker: Arc<dyn Broker>,
}

impl BrokerDeadLetterPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl DeadLetterPublisher for BrokerDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        let message = dead_letter.to_outbound()?;
        let ack = publish_with_retry(self.broker.as_ref(), message, publish_backoff())
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;

        info!(
            subject = %dead_letter.subject(),
            correlation_id = %dead_letter.correlation_id,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Dead letter published"
        );
        Ok(())
    }
}

/// Logs dead letters and drops them.
#[derive(Debug, Default)]
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            subject = %dead_letter.original_subject,
            correlation_id = %dead_letter.correlation_id,
            exception_type = %dead_letter.exception_type,
            "DLQ not configured, dead letter dropped"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// Hands dead letters to an in-process receiver.
#[derive(Debug, Clone)]
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        debug!(subject = %dead_letter.original_subject, "Dead letter sent to channel");
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(format!("receiver dropped: {e}")))
    }
}
