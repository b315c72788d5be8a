//! Boundary-side command publishing.
//!
//! An HTTP or CLI front end turns a request into a command with
//! [`CommandPublisher`]. Publishing is fire-and-forget: the returned
//! correlation id is the only handle the caller gets, and success means the
//! broker stored the command, not that it was processed.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::bus::{Broker, BusError, Result};
use crate::correlation::CorrelationId;
use crate::message::OutboundMessage;
use crate::subject::{StreamKind, SubjectSet, Verb};

/// Publishes commands onto the `cmd` stream.
#[derive(Clone)]
pub struct CommandPublisher {
    broker: Arc<dyn Broker>,
}

impl CommandPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish `body` to a command subject.
    ///
    /// `correlation_id` is forwarded when given; otherwise one is generated.
    /// Either way the id used is returned.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        body: &T,
        correlation_id: Option<CorrelationId>,
    ) -> Result<CorrelationId> {
        let correlation_id = correlation_id.unwrap_or_else(CorrelationId::generate);
        self.publish_to(StreamKind::Cmd, subject, body, &correlation_id)
            .await?;
        Ok(correlation_id)
    }

    /// Publish a CRUD command for an entity.
    pub async fn send_command<T: Serialize + ?Sized>(
        &self,
        set: &SubjectSet,
        verb: Verb,
        body: &T,
        correlation_id: Option<CorrelationId>,
    ) -> Result<CorrelationId> {
        self.send(&set.command(verb), body, correlation_id).await
    }

    /// Publish to any stream with an explicit correlation id.
    pub async fn publish_to<T: Serialize + ?Sized>(
        &self,
        stream: StreamKind,
        subject: &str,
        body: &T,
        correlation_id: &CorrelationId,
    ) -> Result<()> {
        stream.validate_subject(subject)?;
        let message = OutboundMessage::json(stream, subject, body)
            .map_err(|e| BusError::Publish(format!("body encoding failed: {e}")))?
            .with_correlation(correlation_id)
            .ensure_message_id();

        let ack = self.broker.publish(message).await?;
        info!(
            subject,
            correlation_id = %correlation_id,
            sequence = ack.sequence,
            "Command published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBroker;
    use crate::correlation::CORRELATION_HEADER;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_forwards_correlation_id() {
        let broker = Arc::new(MockBroker::new());
        let publisher = CommandPublisher::new(broker.clone());

        let id = publisher
            .send(
                "cmd.projects.CreateProject",
                &json!({"name": "a"}),
                CorrelationId::new("req-42"),
            )
            .await
            .unwrap();

        assert_eq!(id.as_str(), "req-42");
        let sent = broker.published_to(StreamKind::Cmd).await;
        assert_eq!(sent[0].headers.get(CORRELATION_HEADER).unwrap(), "req-42");
        assert!(sent[0].message_id().is_some());
    }

    #[tokio::test]
    async fn test_send_generates_missing_correlation_id() {
        let broker = Arc::new(MockBroker::new());
        let publisher = CommandPublisher::new(broker.clone());
        let set = SubjectSet::new("projects", "Project").unwrap();

        let id = publisher
            .send_command(&set, Verb::Delete, &uuid::Uuid::new_v4(), None)
            .await
            .unwrap();

        let sent = broker.published_to(StreamKind::Cmd).await;
        assert_eq!(sent[0].subject, "cmd.projects.DeleteProject");
        assert_eq!(sent[0].headers.get(CORRELATION_HEADER).unwrap(), id.as_str());
    }

    #[tokio::test]
    async fn test_send_rejects_non_command_subject() {
        let broker = Arc::new(MockBroker::new());
        let publisher = CommandPublisher::new(broker.clone());

        let result = publisher
            .send("events.projects.ProjectCreated", &json!({}), None)
            .await;
        assert!(matches!(result, Err(BusError::InvalidSubject(_))));
        assert_eq!(broker.published_count().await, 0);
    }
}
