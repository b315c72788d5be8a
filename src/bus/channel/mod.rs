//! In-memory channel-based broker for standalone mode.
//!
//! Emulates the parts of JetStream the command core relies on, within a
//! single process:
//! - append-only stream logs with per-stream sequence numbers
//! - deduplication on the message id header
//! - durable consumers created on first subscribe, backfilled from the log
//! - replicas attaching to the same durable compete for its messages, each
//!   message goes to exactly one of them per delivery
//! - `nak` and dropped (never settled) deliveries are redelivered
//!
//! Ack wait timers are not emulated; a delivery that is dropped unsettled
//! is redelivered immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::{Acker, Broker, BusError, ConsumerSpec, Delivery, Result, Subscription};
use crate::message::{Headers, InboundMessage, OutboundMessage, PublishAck, MESSAGE_ID_HEADER};
use crate::subject::{subject_matches, StreamKind};

/// Settlement counters for one durable consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries handed to subscribers, redeliveries included.
    pub delivered: u64,
    pub acked: u64,
    pub naked: u64,
    pub terminated: u64,
    /// Deliveries dropped without being settled.
    pub abandoned: u64,
}

struct StoredMessage {
    sequence: u64,
    subject: String,
    headers: Headers,
    payload: Bytes,
}

impl StoredMessage {
    fn to_inbound(&self, stream: StreamKind, delivered: u64) -> InboundMessage {
        InboundMessage {
            stream: stream.name().to_string(),
            subject: self.subject.clone(),
            message_id: self
                .headers
                .get(MESSAGE_ID_HEADER)
                .cloned()
                .unwrap_or_else(|| self.sequence.to_string()),
            headers: self.headers.clone(),
            payload: self.payload.clone(),
            delivered,
        }
    }
}

struct Pending {
    message: Arc<StoredMessage>,
    delivered: u64,
}

struct DurableConsumer {
    spec: ConsumerSpec,
    sender: mpsc::UnboundedSender<Pending>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<Pending>>,
    stats: Mutex<ConsumerStats>,
}

impl DurableConsumer {
    fn new(spec: ConsumerSpec) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            spec,
            sender,
            receiver: AsyncMutex::new(receiver),
            stats: Mutex::new(ConsumerStats::default()),
        }
    }

    fn stats(&self) -> MutexGuard<'_, ConsumerStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, message: Arc<StoredMessage>, delivered: u64) {
        // The consumer owns both ends, so the channel never closes.
        let _ = self.sender.send(Pending { message, delivered });
    }

    /// Queue another delivery unless `max_deliver` is exhausted.
    fn redeliver(&self, message: Arc<StoredMessage>, delivered: u64) {
        if self.spec.max_deliver.is_some_and(|max| delivered >= max) {
            warn!(
                durable = %self.spec.durable_name,
                sequence = message.sequence,
                delivered,
                "Max deliveries reached, message dropped by consumer"
            );
            return;
        }
        self.enqueue(message, delivered + 1);
    }

    fn delivery(self: &Arc<Self>, pending: Pending) -> Delivery {
        self.stats().delivered += 1;
        let message = pending.message.to_inbound(self.spec.stream, pending.delivered);
        Delivery::new(
            message,
            Box::new(ChannelAcker {
                consumer: self.clone(),
                message: pending.message,
                delivered: pending.delivered,
                settled: AtomicBool::new(false),
            }),
        )
    }
}

struct ChannelAcker {
    consumer: Arc<DurableConsumer>,
    message: Arc<StoredMessage>,
    delivered: u64,
    settled: AtomicBool,
}

impl ChannelAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::Ack(format!(
                "message {} already settled",
                self.message.sequence
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.consumer.stats().acked += 1;
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.settle()?;
        self.consumer.stats().naked += 1;

        match delay {
            Some(delay) if !delay.is_zero() => {
                let consumer = self.consumer.clone();
                let message = self.message.clone();
                let delivered = self.delivered;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    consumer.redeliver(message, delivered);
                });
            }
            _ => self.consumer.redeliver(self.message.clone(), self.delivered),
        }
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        self.settle()?;
        self.consumer.stats().terminated += 1;
        Ok(())
    }
}

impl Drop for ChannelAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.consumer.stats().abandoned += 1;
            debug!(
                durable = %self.consumer.spec.durable_name,
                sequence = self.message.sequence,
                "Delivery dropped unsettled, redelivering"
            );
            self.consumer.redeliver(self.message.clone(), self.delivered);
        }
    }
}

#[derive(Default)]
struct State {
    logs: HashMap<StreamKind, Vec<Arc<StoredMessage>>>,
    dedupe: HashMap<(StreamKind, String), u64>,
    consumers: HashMap<(StreamKind, String), Arc<DurableConsumer>>,
}

/// In-memory broker with JetStream-style durable consumers.
pub struct ChannelBroker {
    state: Mutex<State>,
    /// Total publishes, for waiters.
    published: watch::Sender<u64>,
    closed: watch::Sender<bool>,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    /// Create a new channel broker with empty `cmd`, `events` and `dlq` streams.
    pub fn new() -> Self {
        info!("Channel broker initialized");
        Self {
            state: Mutex::new(State::default()),
            published: watch::Sender::new(0),
            closed: watch::Sender::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every message stored on a stream, in append order.
    pub fn messages(&self, stream: StreamKind) -> Vec<InboundMessage> {
        self.state()
            .logs
            .get(&stream)
            .map(|log| log.iter().map(|m| m.to_inbound(stream, 0)).collect())
            .unwrap_or_default()
    }

    /// Messages on a stream whose subject matches `pattern`.
    pub fn messages_matching(&self, stream: StreamKind, pattern: &str) -> Vec<InboundMessage> {
        self.messages(stream)
            .into_iter()
            .filter(|m| subject_matches(&m.subject, pattern))
            .collect()
    }

    /// Settlement counters for a durable consumer, if it exists.
    pub fn consumer_stats(&self, stream: StreamKind, durable_name: &str) -> Option<ConsumerStats> {
        self.state()
            .consumers
            .get(&(stream, durable_name.to_string()))
            .map(|c| *c.stats())
    }

    /// Wait until at least `count` messages are stored on `stream`.
    pub async fn wait_for_messages(&self, stream: StreamKind, count: usize) {
        let mut rx = self.published.subscribe();
        let _ = rx
            .wait_for(|_| {
                self.state()
                    .logs
                    .get(&stream)
                    .map_or(0, |log| log.len())
                    >= count
            })
            .await;
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(subject = %message.subject))]
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck> {
        if *self.closed.borrow() {
            return Err(BusError::Closed);
        }
        message.stream.validate_subject(&message.subject)?;

        let stream = message.stream;
        let ack = {
            let mut state = self.state();

            if let Some(id) = message.message_id() {
                if let Some(&sequence) = state.dedupe.get(&(stream, id.to_string())) {
                    debug!(message_id = %id, sequence, "Duplicate publish ignored");
                    return Ok(PublishAck {
                        stream: stream.name().to_string(),
                        sequence,
                        duplicate: true,
                    });
                }
            }

            let log = state.logs.entry(stream).or_default();
            let stored = Arc::new(StoredMessage {
                sequence: log.len() as u64 + 1,
                subject: message.subject,
                headers: message.headers,
                payload: message.payload,
            });
            log.push(stored.clone());

            if let Some(id) = stored.headers.get(MESSAGE_ID_HEADER) {
                state.dedupe.insert((stream, id.clone()), stored.sequence);
            }

            for ((consumer_stream, _), consumer) in state.consumers.iter() {
                if *consumer_stream == stream
                    && subject_matches(&stored.subject, &consumer.spec.filter_subject)
                {
                    consumer.enqueue(stored.clone(), 1);
                }
            }

            debug!(stream = %stream, sequence = stored.sequence, "Stored message");
            PublishAck {
                stream: stream.name().to_string(),
                sequence: stored.sequence,
                duplicate: false,
            }
        };

        self.published.send_modify(|n| *n += 1);
        Ok(ack)
    }

    async fn subscribe(&self, spec: ConsumerSpec) -> Result<Subscription> {
        if *self.closed.borrow() {
            return Err(BusError::Closed);
        }

        let consumer = {
            let mut state = self.state();
            let key = (spec.stream, spec.durable_name.clone());

            match state.consumers.get(&key) {
                Some(existing) if existing.spec.filter_subject != spec.filter_subject => {
                    return Err(BusError::Subscribe(format!(
                        "durable {} already bound to filter {}",
                        spec.durable_name, existing.spec.filter_subject
                    )));
                }
                Some(existing) => existing.clone(),
                None => {
                    let consumer = Arc::new(DurableConsumer::new(spec.clone()));
                    let backlog = state
                        .logs
                        .get(&spec.stream)
                        .map(|log| log.as_slice())
                        .unwrap_or_default();
                    for stored in backlog {
                        if subject_matches(&stored.subject, &spec.filter_subject) {
                            consumer.enqueue(stored.clone(), 1);
                        }
                    }
                    info!(
                        durable = %spec.durable_name,
                        filter = %spec.filter_subject,
                        "Durable consumer created"
                    );
                    state.consumers.insert(key, consumer.clone());
                    consumer
                }
            }
        };

        debug!(
            durable = %spec.durable_name,
            queue_group = %spec.queue_group,
            "Subscriber attached"
        );

        let closed = self.closed.subscribe();
        let deliveries = futures::stream::unfold((consumer, closed), |(consumer, mut closed)| async move {
            let pending = {
                let mut receiver = consumer.receiver.lock().await;
                tokio::select! {
                    pending = receiver.recv() => pending,
                    _ = closed.wait_for(|c| *c) => None,
                }
            }?;
            let delivery = consumer.delivery(pending);
            Some((Ok(delivery), (consumer, closed)))
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        info!("Channel broker closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests;
