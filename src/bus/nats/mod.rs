//! NATS JetStream broker.
//!
//! Streams are created on connect if missing, one per [`StreamKind`], each
//! capturing `<name>.>`. Consumers are durable pull consumers with explicit
//! acknowledgement; replicas that attach with the same durable name split
//! the messages between them.
//!
//! # Configuration
//!
//! ```yaml
//! messaging:
//!   type: nats
//!   nats:
//!     url: "nats://localhost:4222"
//!     replicas: 3
//!     duplicate_window_secs: 120
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, AckPolicy, DeliverPolicy},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind, Context,
};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use super::{Acker, Broker, BusError, ConsumerSpec, Delivery, Result, Subscription};
use crate::config::NatsConfig;
use crate::correlation::CORRELATION_HEADER;
use crate::message::{Headers, InboundMessage, OutboundMessage, PublishAck, MESSAGE_ID_HEADER};
use crate::subject::StreamKind;
use crate::utils::bootstrap::connect_with_retry;

/// Headers carried across the wire. Anything else on an inbound message is
/// ignored.
const FORWARDED_HEADERS: [&str; 2] = [CORRELATION_HEADER, MESSAGE_ID_HEADER];

/// Broker backed by NATS JetStream.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: Context,
    closed: AtomicBool,
}

impl NatsBroker {
    /// Connect, retrying with backoff, and ensure the three streams exist.
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let url = config.url.as_str();
        let client = connect_with_retry("nats", url, config.connect_attempts, || {
            async_nats::connect(url)
        })
        .await
        .map_err(|e| BusError::Connection(e.to_string()))?;

        let broker = Self::from_client(client);
        broker.ensure_streams(config).await?;
        Ok(broker)
    }

    /// Wrap an already connected client. Streams are not created.
    pub fn from_client(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            closed: AtomicBool::new(false),
        }
    }

    /// Create any of the `cmd`, `events` and `dlq` streams that are missing.
    pub async fn ensure_streams(&self, config: &NatsConfig) -> Result<()> {
        for kind in StreamKind::ALL {
            let name = kind.name();
            if self.jetstream.get_stream(name).await.is_ok() {
                debug!(stream = name, "Stream exists");
                continue;
            }
            self.jetstream
                .create_stream(StreamConfig {
                    name: name.to_string(),
                    subjects: vec![kind.subject_filter()],
                    retention: RetentionPolicy::Limits,
                    storage: StorageType::File,
                    num_replicas: config.replicas.max(1),
                    duplicate_window: Duration::from_secs(config.duplicate_window_secs),
                    ..Default::default()
                })
                .await
                .map_err(|e| BusError::Connection(format!("Failed to create stream {name}: {e}")))?;
            info!(stream = name, replicas = config.replicas, "Stream created");
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck> {
        self.check_open()?;
        message.stream.validate_subject(&message.subject)?;

        let mut headers = async_nats::HeaderMap::new();
        for name in FORWARDED_HEADERS {
            if let Some(value) = message.headers.get(name) {
                headers.insert(name, value.as_str());
            }
        }

        let ack = self
            .jetstream
            .publish_with_headers(message.subject, headers, message.payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn subscribe(&self, spec: ConsumerSpec) -> Result<Subscription> {
        self.check_open()?;
        let stream = self
            .jetstream
            .get_stream(spec.stream.name())
            .await
            .map_err(|e| BusError::Subscribe(format!("stream {}: {e}", spec.stream.name())))?;

        let max_deliver = spec
            .max_deliver
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(
                &spec.durable_name,
                PullConfig {
                    durable_name: Some(spec.durable_name.clone()),
                    filter_subject: spec.filter_subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: spec.ack_wait,
                    max_deliver,
                    deliver_policy: DeliverPolicy::All,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {}: {e}", spec.durable_name)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        info!(
            durable = %spec.durable_name,
            filter = %spec.filter_subject,
            "Attached to durable consumer"
        );

        Ok(messages
            .map(|item| match item {
                Ok(message) => Ok(into_delivery(message)),
                Err(e) => Err(BusError::Subscribe(e.to_string())),
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}

fn into_delivery(message: jetstream::Message) -> Delivery {
    let (stream, sequence, delivered) = match message.info() {
        Ok(info) => (
            info.stream.to_string(),
            info.stream_sequence,
            u64::try_from(info.delivered).unwrap_or(1).max(1),
        ),
        Err(_) => (String::new(), 0, 1),
    };

    let mut headers = Headers::new();
    if let Some(map) = &message.headers {
        for name in FORWARDED_HEADERS {
            if let Some(value) = map.get(name) {
                headers.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }
    let message_id = headers
        .get(MESSAGE_ID_HEADER)
        .cloned()
        .unwrap_or_else(|| sequence.to_string());

    let inbound = InboundMessage {
        stream,
        subject: message.subject.to_string(),
        message_id,
        headers,
        payload: message.payload.clone(),
        delivered,
    };
    Delivery::new(inbound, Box::new(NatsAcker { message }))
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn term(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}
