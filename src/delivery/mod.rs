//! Realtime delivery bridge.
//!
//! Consumes "deliver to identity" events from the dedicated delivery
//! queue and fans them out through the [`ConnectionRegistry`] to every
//! open connection of the recipient. The recipient may legitimately be
//! offline, so an instruction with no deliverable target is simply
//! acknowledged.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::broker::{
    Broker, BrokerError, Envelope, EventConsumer, EventConsumerConfig, EventHandler, Producer,
    Result,
};
use crate::config::DeliveryConfig;
use crate::context;
use crate::registry::ConnectionRegistry;
use crate::report::{ErrorReporter, ReportTags, StreamKind};

/// Envelope type carrying a delivery instruction.
pub const DELIVERY_SEND: &str = "delivery.send";

/// Payload of a [`DELIVERY_SEND`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryInstruction {
    /// Recipient identity; an absent or empty identity means there is
    /// nothing to deliver.
    #[serde(default)]
    pub identity: Option<String>,
    /// Event type forwarded to the connections.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event payload forwarded to the connections.
    #[serde(default)]
    pub data: Value,
}

/// Known delivery-queue events, plus the unrecognized remainder.
enum DeliveryEvent {
    Send(DeliveryInstruction),
    Unknown(String),
}

impl DeliveryEvent {
    fn parse(kind: &str, data: Value) -> std::result::Result<Self, serde_json::Error> {
        match kind {
            DELIVERY_SEND => Ok(Self::Send(serde_json::from_value(data)?)),
            other => Ok(Self::Unknown(other.to_string())),
        }
    }
}

struct DeliveryHandler {
    registry: Arc<ConnectionRegistry>,
    reporter: Arc<dyn ErrorReporter>,
    queue: String,
}

#[async_trait]
impl EventHandler for DeliveryHandler {
    async fn handle(&self, kind: &str, data: Value) -> Result<()> {
        match DeliveryEvent::parse(kind, data) {
            Ok(DeliveryEvent::Send(instruction)) => {
                let Some(identity) = instruction.identity.filter(|id| !id.is_empty()) else {
                    // recipient unknown or offline: acked, nothing delivered
                    return Ok(());
                };

                let payload =
                    Envelope::new(&instruction.kind, instruction.data).to_bytes()?;
                let payload = String::from_utf8(payload).map_err(|e| {
                    BrokerError::Protocol(format!("delivery payload is not utf-8: {}", e))
                })?;

                let delivered = self.registry.send_to(&identity, &payload).await;
                debug!(
                    identity = %identity,
                    kind = %instruction.kind,
                    delivered,
                    "delivery fan-out"
                );
                Ok(())
            }
            Ok(DeliveryEvent::Unknown(kind)) => {
                // unrecognized types are reported, never silently dropped
                let err =
                    BrokerError::Handler(format!("unrecognized delivery event '{}'", kind));
                let tags = ReportTags::new(StreamKind::Event)
                    .with_queue(&self.queue)
                    .with_message_type(&kind)
                    .with_context(&context::current());
                self.reporter.report(&err, tags, None);
                Ok(())
            }
            // malformed instruction: no deliverable target, acked as a no-op
            Err(_) => Ok(()),
        }
    }
}

/// Dedicated consumer wiring the delivery queue to the registry.
///
/// The queue's failure policy is requeue-on-error: a fan-out
/// interrupted by a fault is retried rather than dropped.
pub struct DeliveryBridge {
    consumer: EventConsumer,
}

impl DeliveryBridge {
    /// Wire the bridge; nothing happens until [`start`].
    ///
    /// [`start`]: DeliveryBridge::start
    pub fn new(
        broker: Arc<Broker>,
        registry: Arc<ConnectionRegistry>,
        reporter: Arc<dyn ErrorReporter>,
        config: DeliveryConfig,
    ) -> Self {
        let handler = Arc::new(DeliveryHandler {
            registry,
            reporter: reporter.clone(),
            queue: config.queue.clone(),
        });
        let consumer_config = EventConsumerConfig::new(&config.queue)
            .with_prefetch(config.prefetch)
            .with_requeue_on_error(true);
        Self {
            consumer: EventConsumer::new(broker, reporter, consumer_config, handler),
        }
    }

    /// Start consuming the delivery queue.
    pub async fn start(&self) -> Result<()> {
        self.consumer.start().await
    }

    /// Queue the bridge consumes.
    pub fn queue(&self) -> &str {
        self.consumer.queue()
    }
}

/// Publishing counterpart of the bridge: enqueues a deliver-to-identity
/// event for whichever process holds the recipient's connections.
pub struct DeliveryPublisher {
    producer: Producer,
    queue: String,
}

impl DeliveryPublisher {
    /// Create a publisher for the configured delivery queue.
    pub fn new(
        broker: Arc<Broker>,
        reporter: Arc<dyn ErrorReporter>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            producer: Producer::new(broker, reporter),
            queue: config.queue.clone(),
        }
    }

    /// Publish one event destined for `identity`'s open connections.
    pub async fn send_to_identity(&self, identity: &str, kind: &str, data: Value) -> Result<()> {
        let instruction = DeliveryInstruction {
            identity: Some(identity.to_string()),
            kind: kind.to_string(),
            data,
        };
        let data = serde_json::to_value(&instruction).map_err(|e| {
            BrokerError::Protocol(format!("failed to serialize delivery instruction: {}", e))
        })?;
        self.producer
            .publish(&self.queue, &Envelope::new(DELIVERY_SEND, data))
            .await
    }
}
