//! Shared broker connection.

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BrokerError, Result};
use crate::config::AmqpConfig;

struct BrokerState {
    connection: Connection,
    channel: Channel,
}

/// Process-scoped handle to the shared broker connection and channel.
///
/// The connection is established lazily on first [`acquire`] and cached
/// for subsequent calls. When the underlying connection or channel is
/// lost, the cached state is discarded so the next `acquire` rebuilds
/// from scratch; in-flight operations on the dropped channel fail
/// immediately. There is no retry or backoff beyond this
/// reset-and-lazy-rebuild policy.
///
/// [`acquire`]: Broker::acquire
pub struct Broker {
    url: String,
    state: Mutex<Option<BrokerState>>,
}

impl Broker {
    /// Create a handle for the given AMQP URL. No I/O happens until
    /// the first `acquire`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(None),
        }
    }

    /// Create a handle from configuration.
    pub fn from_config(config: &AmqpConfig) -> Self {
        Self::new(&config.url)
    }

    /// Get the shared channel, connecting first if necessary.
    pub async fn acquire(&self) -> Result<Channel> {
        let mut state = self.state.lock().await;

        if let Some(current) = state.as_ref() {
            if current.connection.status().connected() && current.channel.status().connected() {
                return Ok(current.channel.clone());
            }
            // connection was lost; rebuild instead of repairing
            debug!(url = %self.url, "cached broker connection is stale, rebuilding");
            *state = None;
        }

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                BrokerError::Transport(format!("failed to connect to '{}': {}", self.url, e))
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Transport(format!("failed to create channel: {}", e)))?;

        info!(url = %self.url, "connected to broker");

        *state = Some(BrokerState {
            connection,
            channel: channel.clone(),
        });

        Ok(channel)
    }

    /// Drop the cached connection so the next `acquire` reconnects.
    pub async fn reset(&self) {
        *self.state.lock().await = None;
    }
}
