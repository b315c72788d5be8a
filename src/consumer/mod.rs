//! Consumer pipeline and service runtime.
//!
//! Every command subject a service owns gets one durable queue-group
//! consumer. Each delivery flows through:
//!
//! ```text
//! Delivery -> MessageContext -> RetryMiddleware(handler) -> Completed     -> emit event -> ack
//!                                                         -> DeadLettered -> term
//!                                                         -> DLQ publish failed         -> nak
//! ```
//!
//! A message is acknowledged only after its event is stored. Every other exit
//! either terminates the delivery (its dead letter is already stored) or
//! leaves it for broker redelivery, so nothing is silently dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use backon::BackoffBuilder;
use futures::StreamExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::bus::{log_settle_failure, Broker, BusError, ConsumerSpec, Delivery, Subscription};
use crate::config::ConsumerConfig;
use crate::correlation::MessageContext;
use crate::crud::{DocumentSession, Entity};
use crate::dlq::{BrokerDeadLetterPublisher, DeadLetterPublisher};
use crate::emitter::EventEmitter;
use crate::handler::{CommandHandler, CreateHandler, DeleteHandler, UpdateHandler};
use crate::retry::{Outcome, RetryMiddleware, RetryPolicy};
use crate::subject::{parse_command_subject, SubjectError, SubjectSet, Verb};
use crate::uow::SessionFactory;
use crate::utils::backoff::{subscription_backoff, SUBSCRIPTION_ERROR_MAX_DELAY};

/// Errors raised while wiring or starting a service.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Invalid subject: {0}")]
    Subject(#[from] SubjectError),

    #[error("Subject {0} already has a handler")]
    DuplicateRoute(String),

    #[error("No routes registered")]
    NoRoutes,

    #[error("Broker error: {0}")]
    Bus(#[from] BusError),

    #[error("Shutdown failed: {0}")]
    Shutdown(String),
}

/// One command subject bound to its handler and event subject.
pub struct Route {
    pub command_subject: String,
    pub event_subject: String,
    pub spec: ConsumerSpec,
    pub handler: Arc<dyn CommandHandler>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("command_subject", &self.command_subject)
            .field("event_subject", &self.event_subject)
            .field("durable_name", &self.spec.durable_name)
            .finish()
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled and its event published.
    Acked,
    /// Retries exhausted; the dead letter is stored and the delivery terminated.
    DeadLettered,
    /// Left for the broker to deliver again.
    Redelivery,
}

/// Per-delivery processing shared by every route of a service.
#[derive(Clone)]
pub struct Pipeline {
    retry: RetryMiddleware,
    emitter: EventEmitter,
}

impl Pipeline {
    pub fn new(retry: RetryMiddleware, emitter: EventEmitter) -> Self {
        Self { retry, emitter }
    }

    pub async fn process(&self, route: &Route, delivery: Delivery) -> Disposition {
        let (ctx, generated) = MessageContext::from_message(delivery.message());
        let span = ctx.span();
        self.process_in_context(route, delivery, ctx, generated)
            .instrument(span)
            .await
    }

    async fn process_in_context(
        &self,
        route: &Route,
        delivery: Delivery,
        ctx: MessageContext,
        generated: bool,
    ) -> Disposition {
        if generated {
            warn!("Command carried no correlation id, generated one");
        }
        info!("Message consumed");

        let outcome = self
            .retry
            .run(&ctx, route.handler.as_ref(), delivery.message())
            .await;

        match outcome {
            Ok(Outcome::Completed { output, attempts }) => {
                match self.emitter.emit(&ctx, &route.event_subject, &output).await {
                    Ok(_) => {
                        log_settle_failure(delivery.ack().await, "ack");
                        info!(attempts, event = %route.event_subject, "Message processed");
                        Disposition::Acked
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            event = %route.event_subject,
                            "Event publish failed, leaving command for redelivery"
                        );
                        log_settle_failure(delivery.nak(None).await, "nak");
                        Disposition::Redelivery
                    }
                }
            }
            Ok(Outcome::DeadLettered(dead_letter)) => {
                log_settle_failure(delivery.term().await, "term");
                info!(
                    attempts = dead_letter.attempt_count,
                    exception_type = %dead_letter.exception_type,
                    "Message dead-lettered"
                );
                Disposition::DeadLettered
            }
            Err(e) => {
                error!(error = %e, "Dead letter publish failed, leaving command for redelivery");
                log_settle_failure(delivery.nak(None).await, "nak");
                Disposition::Redelivery
            }
        }
    }
}

/// Builder for one service's consumers.
pub struct ServiceRuntime {
    service: String,
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    consumer: ConsumerConfig,
    dead_letters: Option<Arc<dyn DeadLetterPublisher>>,
    routes: BTreeMap<String, Arc<Route>>,
}

impl ServiceRuntime {
    pub fn new(
        service: impl Into<String>,
        broker: Arc<dyn Broker>,
        policy: RetryPolicy,
        consumer: ConsumerConfig,
    ) -> Self {
        Self {
            service: service.into(),
            broker,
            policy,
            consumer,
            dead_letters: None,
            routes: BTreeMap::new(),
        }
    }

    /// Override where dead letters go. Defaults to the broker's `dlq` stream.
    pub fn with_dead_letter_publisher(mut self, dead_letters: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Wire `Create`, `Update` and `Delete` for an entity backed by `store`.
    pub fn register<E, F>(&mut self, entity: &str, store: Arc<F>) -> Result<&mut Self, RuntimeError>
    where
        E: Entity,
        F: SessionFactory,
        F::Session: DocumentSession,
    {
        let set = SubjectSet::new(self.service.clone(), entity)?;
        if let Some(taken) = Verb::ALL
            .into_iter()
            .map(|verb| set.command(verb))
            .find(|subject| self.routes.contains_key(subject))
        {
            return Err(RuntimeError::DuplicateRoute(taken));
        }
        for verb in Verb::ALL {
            let handler: Arc<dyn CommandHandler> = match verb {
                Verb::Create => Arc::new(CreateHandler::<E, F>::new(store.clone())),
                Verb::Update => Arc::new(UpdateHandler::<E, F>::new(store.clone())),
                Verb::Delete => Arc::new(DeleteHandler::<E, F>::new(store.clone())),
            };
            self.insert_route(&set, verb, handler)?;
        }
        info!(service = %self.service, entity, kind = E::KIND, "Entity registered");
        Ok(self)
    }

    /// Bind a custom handler to a command subject `cmd.<service>.<Verb><Entity>`.
    /// Its event goes to the matching `events.<service>.<Entity><Verb>d`.
    pub fn route(
        &mut self,
        command_subject: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<&mut Self, RuntimeError> {
        let parsed = parse_command_subject(command_subject)?;
        let set = parsed.subject_set()?;
        self.insert_route(&set, parsed.verb, handler)?;
        Ok(self)
    }

    fn insert_route(
        &mut self,
        set: &SubjectSet,
        verb: Verb,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RuntimeError> {
        let command_subject = set.command(verb);
        if self.routes.contains_key(&command_subject) {
            return Err(RuntimeError::DuplicateRoute(command_subject));
        }
        let spec = ConsumerSpec::for_command(set, verb)
            .with_ack_wait(std::time::Duration::from_secs(self.consumer.ack_wait_secs))
            .with_max_deliver(self.consumer.max_deliver);
        let route = Route {
            command_subject: command_subject.clone(),
            event_subject: set.event(verb),
            spec,
            handler,
        };
        self.routes.insert(command_subject, Arc::new(route));
        Ok(())
    }

    /// Registered command subjects, sorted.
    pub fn subjects(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    pub fn handler_for(&self, command_subject: &str) -> Option<Arc<dyn CommandHandler>> {
        self.routes
            .get(command_subject)
            .map(|route| route.handler.clone())
    }

    /// Subscribe every route and start consuming.
    pub async fn start(self) -> Result<RunningService, RuntimeError> {
        if self.routes.is_empty() {
            return Err(RuntimeError::NoRoutes);
        }

        let ack_wait = std::time::Duration::from_secs(self.consumer.ack_wait_secs);
        if ack_wait <= self.policy.worst_case_delay() {
            warn!(
                ack_wait_secs = ack_wait.as_secs(),
                worst_case_delay_secs = self.policy.worst_case_delay().as_secs(),
                "Ack wait does not cover the retry schedule; deliveries may be handed to another replica mid-retry"
            );
        }

        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(BrokerDeadLetterPublisher::new(self.broker.clone())));
        if !dead_letters.is_configured() {
            warn!("No dead letter destination configured, exhausted commands will be dropped");
        }
        let pipeline = Pipeline::new(
            RetryMiddleware::new(self.policy, dead_letters),
            EventEmitter::new(self.broker.clone()),
        );

        let max_in_flight = self.consumer.max_in_flight.max(1);
        let permits = Arc::new(Semaphore::new(max_in_flight));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut consumers = Vec::with_capacity(self.routes.len());
        for route in self.routes.values() {
            let subscription = self.broker.subscribe(route.spec.clone()).await?;
            info!(
                subject = %route.command_subject,
                durable = %route.spec.durable_name,
                queue_group = %route.spec.queue_group,
                "Consumer started"
            );
            consumers.push(tokio::spawn(consume(
                route.clone(),
                subscription,
                pipeline.clone(),
                permits.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(
            service = %self.service,
            broker = self.broker.name(),
            routes = self.routes.len(),
            max_in_flight,
            "Service started"
        );

        Ok(RunningService {
            service: self.service,
            subjects: self.routes.into_keys().collect(),
            shutdown: shutdown_tx,
            consumers,
            permits,
            max_in_flight,
        })
    }
}

/// Pull deliveries for one route until shutdown, each processed on its own
/// task once an in-flight permit is available.
///
/// The permit is taken after a delivery arrives, so idle routes hold none.
async fn consume(
    route: Arc<Route>,
    mut subscription: Subscription,
    pipeline: Pipeline,
    permits: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut error_delays = subscription_backoff().build();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = subscription.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                let delay = error_delays.next().unwrap_or(SUBSCRIPTION_ERROR_MAX_DELAY);
                warn!(
                    subject = %route.command_subject,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Subscription error, pausing"
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            None => {
                info!(subject = %route.command_subject, "Subscription ended");
                break;
            }
        };
        error_delays = subscription_backoff().build();

        // A delivery dropped here unsettled goes back to the broker.
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let pipeline = pipeline.clone();
        let route = route.clone();
        tokio::spawn(async move {
            let _permit = permit;
            pipeline.process(&route, delivery).await;
        });
    }
}

/// Handle to a started service.
pub struct RunningService {
    service: String,
    subjects: Vec<String>,
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl RunningService {
    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    /// Stop pulling new deliveries and wait for in-flight ones to settle.
    pub async fn shutdown(self) -> Result<(), RuntimeError> {
        info!(service = %self.service, "Shutting down");
        let _ = self.shutdown.send(true);

        for consumer in self.consumers {
            if let Err(e) = consumer.await {
                error!(error = %e, "Consumer task failed");
            }
        }

        let permits = u32::try_from(self.max_in_flight)
            .map_err(|_| RuntimeError::Shutdown("max_in_flight exceeds u32".to_string()))?;
        let _drained = self
            .permits
            .acquire_many(permits)
            .await
            .map_err(|e| RuntimeError::Shutdown(e.to_string()))?;

        info!(service = %self.service, "Service stopped");
        Ok(())
    }
}
