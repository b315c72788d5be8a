//! Messaging and broker configuration types.

use serde::Deserialize;

/// Messaging type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broker (no external dependency).
    #[default]
    Channel,
    /// NATS JetStream.
    Nats,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// NATS-specific configuration.
    pub nats: NatsConfig,
}

/// NATS JetStream configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL.
    pub url: String,
    /// Stream replicas when the `cmd`, `events` and `dlq` streams are created.
    pub replicas: usize,
    /// Duplicate-detection window for the message id header, in seconds.
    pub duplicate_window_secs: u64,
    /// Connection attempts before giving up at startup.
    pub connect_attempts: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            replicas: 1,
            duplicate_window_secs: 120,
            connect_attempts: 10,
        }
    }
}
