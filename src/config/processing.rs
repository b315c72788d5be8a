//! Retry and consumer tuning.

use serde::Deserialize;

use crate::retry::ErrorPolicy;

/// Retry overrides.
///
/// Unset fields fall back to the profile selected by the `debug`, `local`
/// and `is_test` flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Handler invocations per delivery.
    pub max_retries: Option<u32>,
    /// Sleep before each re-invocation, in seconds.
    pub delays_secs: Option<Vec<u64>>,
    /// Whether permanent failures skip the remaining attempts.
    pub error_policy: ErrorPolicy,
}

/// Durable consumer tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Deliveries processed concurrently per service replica.
    pub max_in_flight: usize,
    /// Seconds a delivery may stay unacknowledged before the broker redelivers it.
    ///
    /// Must exceed the worst-case retry schedule, or the broker hands the
    /// message to another replica while the first is still backing off.
    pub ack_wait_secs: u64,
    /// Broker-level delivery limit. `None` is unlimited.
    pub max_deliver: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            ack_wait_secs: 300,
            max_deliver: None,
        }
    }
}
