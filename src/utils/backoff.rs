//! Infrastructure backoff: publish and connection retries.
//!
//! Uses `backon` for exponential backoff with jitter. This is separate from the
//! handler retry schedule in [`crate::retry`], which is fixed and
//! operator-visible; these retries cover brief broker hiccups only.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::warn;

use crate::bus::{Broker, BusError, Result};
use crate::message::{OutboundMessage, PublishAck};

/// Backoff for publishing events and dead letters.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 3
/// - Jitter enabled
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

/// Backoff for broker connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Jitter enabled
pub fn connection_backoff(max_attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_attempts.saturating_sub(1))
        .with_jitter()
}

/// Backoff between consecutive subscription errors.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Jitter enabled
///
/// Once exhausted, callers keep pausing for [`SUBSCRIPTION_ERROR_MAX_DELAY`].
pub fn subscription_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(SUBSCRIPTION_ERROR_MAX_DELAY)
        .with_max_times(8)
        .with_jitter()
}

pub const SUBSCRIPTION_ERROR_MAX_DELAY: Duration = Duration::from_secs(5);

/// Whether a publish error may clear up on its own.
pub fn is_retryable(error: &BusError) -> bool {
    matches!(error, BusError::Publish(_) | BusError::Connection(_))
}

/// Publish, retrying retryable failures under `backoff`.
///
/// Messages carry a deduplication id, so a retry after a lost ack is stored
/// once.
pub async fn publish_with_retry(
    broker: &dyn Broker,
    message: OutboundMessage,
    backoff: ExponentialBuilder,
) -> Result<PublishAck> {
    let message = message.ensure_message_id();
    let mut last_error = None;

    for (attempt, delay) in std::iter::once(Duration::ZERO)
        .chain(backoff.build())
        .enumerate()
    {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
        }

        match broker.publish(message.clone()).await {
            Ok(ack) => return Ok(ack),
            Err(e) if is_retryable(&e) => {
                warn!(
                    attempt = attempt + 1,
                    subject = %message.subject,
                    error = %e,
                    "Publish failed, retrying..."
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| BusError::Publish("publish retries exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBroker;
    use crate::subject::StreamKind;

    #[tokio::test(start_paused = true)]
    async fn test_publish_with_retry_gives_up_after_budget() {
        let broker = MockBroker::new();
        broker.set_fail_on_publish(true).await;

        let message = OutboundMessage::new(StreamKind::Events, "events.projects.ProjectCreated", "{}");
        let result = publish_with_retry(&broker, message, publish_backoff()).await;

        assert!(matches!(result, Err(BusError::Connection(_))));
        assert_eq!(broker.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_with_retry_does_not_retry_invalid_subject() {
        let broker = MockBroker::new();
        let message = OutboundMessage::new(StreamKind::Events, "cmd.projects.CreateProject", "{}");

        let result = publish_with_retry(&broker, message, publish_backoff()).await;
        assert!(matches!(result, Err(BusError::InvalidSubject(_))));
    }

    #[tokio::test]
    async fn test_publish_assigns_message_id() {
        let broker = MockBroker::new();
        let message = OutboundMessage::new(StreamKind::Events, "events.projects.ProjectCreated", "{}");

        publish_with_retry(&broker, message, publish_backoff())
            .await
            .unwrap();
        let published = broker.take_published().await;
        assert!(published[0].message_id().is_some());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&BusError::Publish("timeout".into())));
        assert!(is_retryable(&BusError::Connection("reset".into())));
        assert!(!is_retryable(&BusError::Closed));
    }
}
