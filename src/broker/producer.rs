//! Durable fire-and-forget publishing.

use std::sync::Arc;

use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use tracing::debug;

use super::{Broker, BrokerError, Envelope, Result};
use crate::context;
use crate::report::{ErrorReporter, ReportTags, StreamKind};

/// Publishes envelopes to named durable queues.
///
/// Deliveries are marked persistent and carry the ambient request
/// context as headers. A failed send is reported to the observability
/// collaborator and then surfaced to the caller; there is no implicit
/// retry.
pub struct Producer {
    broker: Arc<Broker>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Producer {
    /// Create a producer on the shared broker connection.
    pub fn new(broker: Arc<Broker>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { broker, reporter }
    }

    /// Publish one envelope to `queue`, declaring it durable first.
    pub async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<()> {
        let channel = self.broker.acquire().await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Transport(format!("failed to declare queue '{}': {}", queue, e))
            })?;

        let payload = envelope.to_bytes()?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2) // persistent
            .with_headers(context::inject_headers());

        if let Err(err) = Self::send(&channel, queue, &payload, properties).await {
            let tags = ReportTags::new(StreamKind::Producer)
                .with_queue(queue)
                .with_message_type(&envelope.kind)
                .with_context(&context::current());
            let payload = serde_json::to_value(envelope).ok();
            self.reporter.report(&err, tags, payload.as_ref());
            return Err(err);
        }

        debug!(queue = %queue, kind = %envelope.kind, "published envelope");
        Ok(())
    }

    async fn send(
        channel: &Channel,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| {
                BrokerError::Transport(format!("failed to publish to '{}': {}", queue, e))
            })?;

        confirm.await.map_err(|e| {
            BrokerError::Transport(format!("publish confirmation failed for '{}': {}", queue, e))
        })?;

        Ok(())
    }
}
