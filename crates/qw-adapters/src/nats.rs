//! NATS message bus adapter
//!
//! Publishes journal records to core NATS subjects keyed by run id. The
//! feed is best effort: the journal is the source of truth and delivery
//! loss never affects run correctness, so there is no JetStream layer
//! here and publish failures only surface as warnings upstream.

use qw_ports::{MessageBus, MessageBusError};
use tracing::info;

/// NATS connection settings
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URL, e.g. `nats://localhost:4222`
    pub url: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
        }
    }
}

impl NatsConfig {
    /// Read settings from the environment.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
        }
    }
}

/// Best-effort journal feed over core NATS
pub struct NatsEventPublisher {
    client: async_nats::Client,
}

impl NatsEventPublisher {
    pub async fn connect(config: NatsConfig) -> Result<Self, MessageBusError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| MessageBusError::Connection {
                message: e.to_string(),
            })?;
        info!(url = %config.url, "connected to NATS");
        Ok(Self { client })
    }
}

impl MessageBus for NatsEventPublisher {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), MessageBusError> {
        self.client
            .publish(subject.to_string(), payload.to_vec().into())
            .await
            .map_err(|e| MessageBusError::Publish {
                message: e.to_string(),
            })
    }
}

/// A bus that drops everything, for embedders and tests without NATS
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBus;

impl MessageBus for NoopBus {
    async fn publish(&self, _subject: &str, _payload: &[u8]) -> Result<(), MessageBusError> {
        Ok(())
    }
}
