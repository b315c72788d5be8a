//! Broker abstraction.
//!
//! A JetStream-style durable publish/subscribe broker: three streams (`cmd`,
//! `events`, `dlq`), durable consumers shared by replicas as a queue group,
//! explicit per-message acknowledgement.
//!
//! Implementations:
//! - `channel`: in-process broker for standalone mode and tests
//! - `nats`: NATS JetStream
//! - `mock`: records publishes for unit tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;

use crate::message::{InboundMessage, OutboundMessage, PublishAck};
use crate::subject::{StreamKind, SubjectError, SubjectSet, Verb};

#[cfg(feature = "channel")]
pub mod channel;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

pub use crate::config::{MessagingConfig, MessagingType, NatsConfig};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Invalid subject: {0}")]
    InvalidSubject(#[from] SubjectError),

    #[error("Broker closed")]
    Closed,

    #[error("Messaging backend not available: {0}")]
    Unavailable(String),
}

/// Default time a delivery may stay unacknowledged before redelivery.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Durable consumer definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub stream: StreamKind,
    pub filter_subject: String,
    /// Replicas subscribing with the same durable name share its messages.
    pub durable_name: String,
    pub queue_group: String,
    pub ack_wait: Duration,
    /// Delivery attempts before the broker gives up. `None` is unlimited.
    pub max_deliver: Option<u64>,
}

impl ConsumerSpec {
    /// Consumer for one command subject of an entity.
    pub fn for_command(set: &SubjectSet, verb: Verb) -> Self {
        Self {
            stream: StreamKind::Cmd,
            filter_subject: set.command(verb),
            durable_name: set.durable_name(verb),
            queue_group: set.queue_group(verb),
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: None,
        }
    }

    /// Consumer with an explicit durable name, e.g. for event subscribers.
    pub fn new(stream: StreamKind, filter_subject: impl Into<String>, durable_name: impl Into<String>) -> Self {
        let durable_name = durable_name.into();
        Self {
            stream,
            filter_subject: filter_subject.into(),
            queue_group: format!("{durable_name}-workers"),
            durable_name,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: None,
        }
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: Option<u64>) -> Self {
        self.max_deliver = max_deliver;
        self
    }
}

/// Acknowledgement side of a delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Processing finished; do not redeliver.
    async fn ack(&self) -> Result<()>;

    /// Processing failed; redeliver, optionally after `delay`.
    async fn nak(&self, delay: Option<Duration>) -> Result<()>;

    /// Handled but not redeliverable.
    async fn term(&self) -> Result<()>;
}

/// A message handed to one member of a queue group.
///
/// Settling methods consume the delivery so each one is settled at most once.
pub struct Delivery {
    message: InboundMessage,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: InboundMessage, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nak(self, delay: Option<Duration>) -> Result<()> {
        self.acker.nak(delay).await
    }

    pub async fn term(self) -> Result<()> {
        self.acker.term().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries for one durable consumer.
pub type Subscription = BoxStream<'static, Result<Delivery>>;

/// Durable publish/subscribe broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a message on its stream. Resolves once the broker accepted it.
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck>;

    /// Attach to a durable consumer, creating it on first use.
    async fn subscribe(&self, spec: ConsumerSpec) -> Result<Subscription>;

    /// Release the connection. Further calls fail with [`BusError::Closed`].
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// Initialize the broker selected by configuration.
pub async fn init_broker(config: &MessagingConfig) -> Result<Arc<dyn Broker>> {
    match config.messaging_type {
        MessagingType::Channel => {
            #[cfg(feature = "channel")]
            {
                Ok(Arc::new(channel::ChannelBroker::new()))
            }
            #[cfg(not(feature = "channel"))]
            {
                Err(BusError::Unavailable(
                    "channel broker requires the 'channel' feature".to_string(),
                ))
            }
        }
        MessagingType::Nats => {
            #[cfg(feature = "nats")]
            {
                let broker = nats::NatsBroker::connect(&config.nats).await?;
                Ok(Arc::new(broker))
            }
            #[cfg(not(feature = "nats"))]
            {
                warn!("NATS messaging requested but the 'nats' feature is not compiled in");
                Err(BusError::Unavailable(
                    "NATS broker requires the 'nats' feature".to_string(),
                ))
            }
        }
    }
}

/// Log an acknowledgement error instead of propagating it.
///
/// An acknowledgement that never reaches the broker results in redelivery
/// after the ack wait, which the at-least-once contract already covers.
pub(crate) fn log_settle_failure(result: Result<()>, action: &'static str) {
    if let Err(e) = result {
        warn!(action, error = %e, "Failed to settle delivery");
    }
}
