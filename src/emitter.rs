//! Event emission.
//!
//! Publishes one event per successfully handled command to the `events`
//! stream. The event carries the command's correlation id, and its message id
//! is derived from the command's, so a command that is redelivered after its
//! event was already stored does not produce a second event.

use std::sync::Arc;

use backon::ExponentialBuilder;
use serde_json::Value;
use tracing::info;

use crate::bus::{Broker, BusError, Result};
use crate::correlation::MessageContext;
use crate::message::{OutboundMessage, PublishAck};
use crate::subject::StreamKind;
use crate::utils::backoff::{publish_backoff, publish_with_retry};

/// Publishes events to the `events` stream.
#[derive(Clone)]
pub struct EventEmitter {
    broker: Arc<dyn Broker>,
    backoff: ExponentialBuilder,
}

impl EventEmitter {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            backoff: publish_backoff(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    /// Deduplication id of the event produced by command `command_message_id`.
    pub fn event_message_id(command_message_id: &str) -> String {
        format!("evt-{command_message_id}")
    }

    #[tracing::instrument(name = "emitter.emit", skip_all, fields(subject = %subject))]
    pub async fn emit(&self, ctx: &MessageContext, subject: &str, body: &Value) -> Result<PublishAck> {
        let message = OutboundMessage::json(StreamKind::Events, subject, body)
            .map_err(|e| BusError::Publish(format!("event encoding failed: {e}")))?
            .with_correlation(&ctx.correlation_id)
            .with_message_id(Self::event_message_id(&ctx.message_id));

        let ack = publish_with_retry(self.broker.as_ref(), message, self.backoff.clone()).await?;
        info!(
            correlation_id = %ctx.correlation_id,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Event published"
        );
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBroker;
    use crate::correlation::CORRELATION_HEADER;
    use crate::test_utils::inbound;
    use serde_json::json;

    fn ctx() -> MessageContext {
        MessageContext::from_message(&inbound("cmd.projects.CreateProject", "{}", Some("r1"))).0
    }

    #[tokio::test]
    async fn test_emit_publishes_with_correlation() {
        let broker = Arc::new(MockBroker::new());
        let emitter = EventEmitter::new(broker.clone());
        let ctx = ctx();

        emitter
            .emit(&ctx, "events.projects.ProjectCreated", &json!({"name": "a"}))
            .await
            .unwrap();

        let events = broker.published_to(StreamKind::Events).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject, "events.projects.ProjectCreated");
        assert_eq!(events[0].headers.get(CORRELATION_HEADER).unwrap(), "r1");
        assert_eq!(
            events[0].message_id(),
            Some(EventEmitter::event_message_id(&ctx.message_id).as_str())
        );
        assert_eq!(events[0].payload.as_ref(), br#"{"name":"a"}"#);
    }

    #[tokio::test]
    async fn test_emit_rejects_command_subject() {
        let broker = Arc::new(MockBroker::new());
        let emitter = EventEmitter::new(broker.clone());

        let result = emitter
            .emit(&ctx(), "cmd.projects.CreateProject", &json!({}))
            .await;
        assert!(matches!(result, Err(BusError::InvalidSubject(_))));
        assert_eq!(broker.published_count().await, 0);
    }
}
