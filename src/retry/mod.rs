//! Bounded retry with a fixed delay schedule, ending in the dead-letter stream.
//!
//! Per delivery the middleware runs this state machine:
//!
//! ```text
//! Received -> Processing -> Success                       (terminal)
//!                        -> Failure, attempt < max  -> sleep(delay[attempt]) -> Processing
//!                        -> Failure, attempt == max -> DeadLettered          (terminal)
//! ```
//!
//! Attempts are 1-based. The sleep after failed attempt `k` is `delays[k - 1]`,
//! clamped to the last entry of the schedule. No sleep follows the final
//! attempt, so the last scheduled delay of the production profile is never
//! used.
//!
//! The handler owns its unit of work: by the time a failure reaches the
//! middleware the session has already been rolled back and closed, so no
//! storage session is held during the sleep.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::correlation::MessageContext;
use crate::dlq::{DeadLetter, DeadLetterPublisher, DlqError};
use crate::handler::{CommandHandler, HandlerError};
use crate::message::InboundMessage;

/// Handler invocations per delivery in production.
pub const PRODUCTION_MAX_RETRIES: u32 = 5;
/// Production delay schedule, in seconds.
pub const PRODUCTION_DELAYS_SECS: [u64; 5] = [5, 15, 30, 60, 120];
/// Handler invocations per delivery under debug, local or test configuration.
pub const DEBUG_MAX_RETRIES: u32 = 1;
/// Debug delay schedule, in seconds.
pub const DEBUG_DELAYS_SECS: [u64; 1] = [1];

/// How failures of different kinds are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Every failure is retried until the attempt budget is spent.
    #[default]
    Uniform,
    /// Malformed payloads and business-rule failures are dead-lettered on
    /// first occurrence; only transient failures are retried.
    FailFastPermanent,
}

/// Retry budget and delay schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delays: Vec<Duration>,
    error_policy: ErrorPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::production()
    }
}

impl RetryPolicy {
    /// Build a policy. `max_retries` is raised to 1 if zero.
    pub fn new(max_retries: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_retries: max_retries.max(1),
            delays,
            error_policy: ErrorPolicy::default(),
        }
    }

    /// 5 attempts, waiting 5s, 15s, 30s, 60s between them.
    pub fn production() -> Self {
        Self::new(
            PRODUCTION_MAX_RETRIES,
            PRODUCTION_DELAYS_SECS.map(Duration::from_secs).to_vec(),
        )
    }

    /// A single attempt.
    pub fn debug() -> Self {
        Self::new(
            DEBUG_MAX_RETRIES,
            DEBUG_DELAYS_SECS.map(Duration::from_secs).to_vec(),
        )
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    /// Sleep after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }

    /// Whether a failure on `attempt` earns another invocation.
    pub fn should_retry(&self, attempt: u32, error: &HandlerError) -> bool {
        if self.is_last_attempt(attempt) {
            return false;
        }
        match self.error_policy {
            ErrorPolicy::Uniform => true,
            ErrorPolicy::FailFastPermanent => !error.is_permanent(),
        }
    }

    /// Total time spent sleeping when every attempt fails.
    pub fn worst_case_delay(&self) -> Duration {
        (1..self.max_retries).map(|a| self.delay_for_attempt(a)).sum()
    }
}

/// Terminal result of running a delivery through the middleware.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler succeeded; its output becomes the event body.
    Completed { output: Value, attempts: u32 },
    /// Retries were exhausted and the entry was published to the `dlq` stream.
    DeadLettered(Box<DeadLetter>),
}

/// Wraps handler invocations with bounded retries and dead-lettering.
///
/// Handler errors are caught here and nowhere else. Only a failure to publish
/// the dead letter itself escapes, so the caller can leave the delivery
/// unacknowledged for redelivery.
#[derive(Clone)]
pub struct RetryMiddleware {
    policy: RetryPolicy,
    dead_letters: Arc<dyn DeadLetterPublisher>,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy, dead_letters: Arc<dyn DeadLetterPublisher>) -> Self {
        Self {
            policy,
            dead_letters,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run(
        &self,
        ctx: &MessageContext,
        handler: &dyn CommandHandler,
        message: &InboundMessage,
    ) -> Result<Outcome, DlqError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let attempt_ctx = ctx.for_attempt(attempt);

            let error = match handler.handle(&attempt_ctx, &message.payload).await {
                Ok(output) => {
                    if attempt > 1 {
                        info!(attempt, "Handler succeeded after retry");
                    }
                    return Ok(Outcome::Completed {
                        output,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            if !self.policy.should_retry(attempt, &error) {
                error!(
                    attempt,
                    max_retries = self.policy.max_retries(),
                    error_type = error.type_name(),
                    error = %error,
                    "Max retries exceeded, sending to DLQ"
                );
                let dead_letter = DeadLetter::from_failure(&attempt_ctx, message, attempt, &error);
                self.dead_letters.publish(dead_letter.clone()).await?;
                return Ok(Outcome::DeadLettered(Box::new(dead_letter)));
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                attempt,
                max_retries = self.policy.max_retries(),
                delay_secs = delay.as_secs_f64(),
                error_type = error.type_name(),
                error = %error,
                "Handler failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
