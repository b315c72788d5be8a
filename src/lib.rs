//! cqbus - command/event processing core
//!
//! Services consume commands from a durable `cmd` stream as queue groups,
//! run each one inside a unit of work with bounded retry, emit the resulting
//! event on `events`, and dead-letter commands that exhaust their attempts
//! onto `dlq`.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod correlation;
pub mod crud;
pub mod dlq;
pub mod emitter;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod subject;
pub mod uow;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use bus::{Broker, BusError, ConsumerSpec, Delivery};
pub use config::Config;
pub use consumer::{RunningService, RuntimeError, ServiceRuntime};
pub use correlation::{CorrelationId, MessageContext};
pub use crud::{CrudEngine, CrudError, Entity, Filter};
pub use handler::{CommandHandler, HandlerError};
pub use publisher::CommandPublisher;
pub use retry::{ErrorPolicy, RetryPolicy};
pub use subject::{StreamKind, SubjectSet, Verb};
pub use uow::{SessionFactory, UnitOfWork};
