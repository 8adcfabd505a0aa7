//! Queue consumption and handler dispatch.
//!
//! One generic dispatch loop serves both consumer capabilities:
//! fire-and-forget event handling (ack on success, nack on failure with
//! a per-consumer requeue policy) and request-reply handling (always
//! exactly one reply, always ack). The capability is selected by
//! [`Dispatch`], not by subclassing.

use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use serde_json::Value;
use tracing::{error, info, warn};

use super::{Broker, BrokerError, Envelope, EventHandler, Result, RpcHandler};
use crate::context::{self, ContextData};
use crate::report::{ErrorReporter, ReportTags, StreamKind};

/// Default prefetch bound for event consumers.
pub(crate) const DEFAULT_EVENT_PREFETCH: u16 = 10;

/// Handler capability consumed by the dispatch loop.
pub(crate) enum Dispatch {
    /// Fire-and-forget: ack/nack only.
    Event {
        handler: Arc<dyn EventHandler>,
        requeue_on_error: bool,
    },
    /// Request-reply: always reply, always ack.
    Rpc { handler: Arc<dyn RpcHandler> },
}

impl Dispatch {
    fn stream_kind(&self) -> StreamKind {
        match self {
            Dispatch::Event { .. } => StreamKind::Event,
            Dispatch::Rpc { .. } => StreamKind::Rpc,
        }
    }
}

/// Configuration for an event consumer.
#[derive(Debug, Clone)]
pub struct EventConsumerConfig {
    /// Durable queue to consume.
    pub queue: String,
    /// Maximum unacknowledged messages in flight.
    pub prefetch: u16,
    /// Whether handler failures redeliver the message. Explicit
    /// required configuration per consumer; parse failures never
    /// requeue regardless.
    pub requeue_on_error: bool,
}

impl EventConsumerConfig {
    /// Config with the default prefetch (10) and drop-on-error policy.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: DEFAULT_EVENT_PREFETCH,
            requeue_on_error: false,
        }
    }

    /// Override the prefetch bound.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Override the redelivery policy for handler failures.
    pub fn with_requeue_on_error(mut self, requeue: bool) -> Self {
        self.requeue_on_error = requeue;
        self
    }
}

/// Durable queue subscription with explicit acknowledgment.
pub struct EventConsumer {
    broker: Arc<Broker>,
    reporter: Arc<dyn ErrorReporter>,
    config: EventConsumerConfig,
    handler: Arc<dyn EventHandler>,
}

impl EventConsumer {
    /// Create a consumer; nothing happens until [`start`].
    ///
    /// [`start`]: EventConsumer::start
    pub fn new(
        broker: Arc<Broker>,
        reporter: Arc<dyn ErrorReporter>,
        config: EventConsumerConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            broker,
            reporter,
            config,
            handler,
        }
    }

    /// Queue this consumer is bound to.
    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    /// Declare the queue, apply the prefetch bound and begin consuming.
    /// Startup failures surface to the caller; the pump loop then runs
    /// in a background task.
    pub async fn start(&self) -> Result<()> {
        let channel = self.broker.acquire().await?;
        start_dispatch(
            channel,
            self.config.queue.clone(),
            self.config.prefetch,
            Arc::new(Dispatch::Event {
                handler: self.handler.clone(),
                requeue_on_error: self.config.requeue_on_error,
            }),
            self.reporter.clone(),
        )
        .await
    }
}

/// Set up a manual-ack consumer on `queue` and spawn its pump loop.
pub(crate) async fn start_dispatch(
    channel: Channel,
    queue: String,
    prefetch: u16,
    dispatch: Arc<Dispatch>,
    reporter: Arc<dyn ErrorReporter>,
) -> Result<()> {
    channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Transport(format!("failed to declare queue '{}': {}", queue, e)))?;

    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| BrokerError::Transport(format!("failed to set prefetch: {}", e)))?;

    let tag = format!("courier-{}-{}", dispatch.stream_kind().as_str(), queue);
    let consumer = channel
        .basic_consume(
            &queue,
            &tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            BrokerError::Transport(format!("failed to start consumer on '{}': {}", queue, e))
        })?;

    info!(
        queue = %queue,
        prefetch,
        kind = dispatch.stream_kind().as_str(),
        "consumer listening"
    );

    tokio::spawn(pump(channel, queue, consumer, dispatch, reporter));

    Ok(())
}

async fn pump(
    channel: Channel,
    queue: String,
    mut consumer: lapin::Consumer,
    dispatch: Arc<Dispatch>,
    reporter: Arc<dyn ErrorReporter>,
) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => {
                // handlers run concurrently; the broker's prefetch
                // bounds how many are unacknowledged at once
                tokio::spawn(process_delivery(
                    channel.clone(),
                    queue.clone(),
                    delivery,
                    dispatch.clone(),
                    reporter.clone(),
                ));
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "consumer delivery error");
                break;
            }
        }
    }
    info!(queue = %queue, "consumer stream ended");
}

async fn process_delivery(
    channel: Channel,
    queue: String,
    delivery: Delivery,
    dispatch: Arc<Dispatch>,
    reporter: Arc<dyn ErrorReporter>,
) {
    let envelope = match Envelope::from_bytes(&delivery.data) {
        Ok(envelope) => envelope,
        Err(err) => {
            let tags =
                ReportTags::from_delivery(dispatch.stream_kind(), &queue, &delivery.properties, None);
            let raw = Value::String(String::from_utf8_lossy(&delivery.data).into_owned());
            reporter.report(&err, tags, Some(&raw));
            // protocol errors are terminal for the message, never requeued
            nack(&delivery, false, &queue).await;
            return;
        }
    };

    let ctx = context::from_properties(&delivery.properties);

    match &*dispatch {
        Dispatch::Event {
            handler,
            requeue_on_error,
        } => {
            let outcome = context::scope(
                ctx,
                handler.handle(&envelope.kind, envelope.data.clone()),
            )
            .await;

            match outcome {
                Ok(()) => ack(&delivery, &queue).await,
                Err(err) => {
                    report_failure(&reporter, &dispatch, &queue, &delivery, &envelope, &err);
                    nack(&delivery, *requeue_on_error, &queue).await;
                }
            }
        }
        Dispatch::Rpc { handler } => {
            let outcome = context::scope(
                ctx.clone(),
                handler.handle(&envelope.kind, envelope.data.clone()),
            )
            .await;

            let reply = match outcome {
                Ok(reply) => reply,
                Err(err) => {
                    report_failure(&reporter, &dispatch, &queue, &delivery, &envelope, &err);
                    // fixed caller-safe reply so the client never times
                    // out on a handler fault
                    handler.error_reply()
                }
            };

            send_reply(&channel, &delivery, &ctx, &reply, &reporter, &queue, &envelope).await;
            // ack on both paths: redelivering an RPC request only
            // creates duplicate work for a client that already got its
            // answer or gave up
            ack(&delivery, &queue).await;
        }
    }
}

fn report_failure(
    reporter: &Arc<dyn ErrorReporter>,
    dispatch: &Dispatch,
    queue: &str,
    delivery: &Delivery,
    envelope: &Envelope,
    err: &BrokerError,
) {
    let tags = ReportTags::from_delivery(
        dispatch.stream_kind(),
        queue,
        &delivery.properties,
        Some(envelope),
    );
    let payload = serde_json::to_value(envelope).ok();
    reporter.report(err, tags, payload.as_ref());
}

/// Send exactly one reply to the request's reply queue, tagged with the
/// original correlation id and forwarding the request's context
/// headers. A missing reply queue skips the reply; the request is still
/// acknowledged by the caller.
async fn send_reply(
    channel: &Channel,
    delivery: &Delivery,
    ctx: &ContextData,
    reply: &Value,
    reporter: &Arc<dyn ErrorReporter>,
    queue: &str,
    envelope: &Envelope,
) {
    let Some(reply_to) = delivery.properties.reply_to() else {
        warn!(queue = %queue, kind = %envelope.kind, "rpc request without reply queue");
        return;
    };

    let payload = match serde_json::to_vec(reply) {
        Ok(payload) => payload,
        Err(e) => {
            let err = BrokerError::Protocol(format!("failed to serialize rpc reply: {}", e));
            let tags = ReportTags::from_delivery(
                StreamKind::Rpc,
                queue,
                &delivery.properties,
                Some(envelope),
            );
            reporter.report(&err, tags, None);
            return;
        }
    };

    let mut properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_headers(context::headers_from(ctx));
    if let Some(correlation) = delivery.properties.correlation_id() {
        properties = properties.with_correlation_id(correlation.clone());
    }

    let sent = async {
        channel
            .basic_publish(
                "",
                reply_to.as_str(),
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Transport(format!("failed to send rpc reply: {}", e)))?
            .await
            .map_err(|e| {
                BrokerError::Transport(format!("rpc reply confirmation failed: {}", e))
            })?;
        Ok::<_, BrokerError>(())
    }
    .await;

    if let Err(err) = sent {
        let tags = ReportTags::from_delivery(
            StreamKind::Rpc,
            queue,
            &delivery.properties,
            Some(envelope),
        );
        reporter.report(&err, tags, Some(reply));
    }
}

async fn ack(delivery: &Delivery, queue: &str) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!(queue = %queue, error = %e, "failed to ack message");
    }
}

async fn nack(delivery: &Delivery, requeue: bool, queue: &str) {
    let options = BasicNackOptions {
        requeue,
        ..Default::default()
    };
    if let Err(e) = delivery.nack(options).await {
        error!(queue = %queue, error = %e, "failed to nack message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_consumer_config_defaults() {
        let config = EventConsumerConfig::new("post-events");
        assert_eq!(config.queue, "post-events");
        assert_eq!(config.prefetch, 10);
        assert!(!config.requeue_on_error);
    }

    #[test]
    fn test_event_consumer_config_builders() {
        let config = EventConsumerConfig::new("delivery-events")
            .with_prefetch(100)
            .with_requeue_on_error(true);
        assert_eq!(config.prefetch, 100);
        assert!(config.requeue_on_error);
    }
}
