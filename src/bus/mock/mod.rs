//! Mock broker for testing.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Broker, BusError, ConsumerSpec, Result, Subscription};
use crate::message::{OutboundMessage, PublishAck};
use crate::subject::StreamKind;

/// Mock broker that records publishes and never delivers.
#[derive(Default)]
pub struct MockBroker {
    published: RwLock<Vec<OutboundMessage>>,
    fail_on_publish: RwLock<bool>,
    /// Fail only publishes to this stream.
    fail_stream: RwLock<Option<StreamKind>>,
    sequence: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_stream(&self, stream: Option<StreamKind>) {
        *self.fail_stream.write().await = stream;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published_to(&self, stream: StreamKind) -> Vec<OutboundMessage> {
        self.published
            .read()
            .await
            .iter()
            .filter(|m| m.stream == stream)
            .cloned()
            .collect()
    }

    pub async fn take_published(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        if *self.fail_stream.read().await == Some(message.stream) {
            return Err(BusError::Publish(format!(
                "Mock publish failure on stream {}",
                message.stream
            )));
        }
        message.stream.validate_subject(&message.subject)?;

        let stream = message.stream.name().to_string();
        self.published.write().await.push(message);
        Ok(PublishAck {
            stream,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            duplicate: false,
        })
    }

    async fn subscribe(&self, spec: ConsumerSpec) -> Result<Subscription> {
        Err(BusError::Subscribe(format!(
            "MockBroker does not deliver ({})",
            spec.durable_name
        )))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
