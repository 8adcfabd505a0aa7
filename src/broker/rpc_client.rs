//! Request-reply calling.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::pending::PendingReplies;
use super::{Broker, BrokerError, Envelope, Result};
use crate::config::RpcConfig;
use crate::context;
use crate::report::{ErrorReporter, ReportTags, StreamKind};

/// Configuration for an RPC client.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Request queue the server listens on.
    pub queue: String,
    /// Default call deadline.
    pub timeout: Duration,
}

impl RpcClientConfig {
    /// Config with the default 5 second deadline.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            timeout: Duration::from_millis(RpcConfig::default().timeout_ms),
        }
    }

    /// Override the default deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Request/reply client over the broker.
///
/// Each call owns an ephemeral exclusive reply queue and a fresh
/// correlation token. The reply path and the timeout path race to
/// complete the call's pending entry; whichever removes it first wins
/// and the other observes a no-op. A timeout cancels only the wait —
/// the dispatched request is not retracted, and a late reply lands in
/// the orphaned reply queue, which the broker tears down with the
/// cancelled consumer.
pub struct RpcClient {
    broker: Arc<Broker>,
    reporter: Arc<dyn ErrorReporter>,
    config: RpcClientConfig,
    pending: Arc<PendingReplies>,
}

impl RpcClient {
    /// Create a client on the shared broker connection.
    pub fn new(
        broker: Arc<Broker>,
        reporter: Arc<dyn ErrorReporter>,
        config: RpcClientConfig,
    ) -> Self {
        Self {
            broker,
            reporter,
            config,
            pending: Arc::new(PendingReplies::new()),
        }
    }

    /// Call with the configured default deadline.
    pub async fn call(&self, kind: &str, data: Value) -> Result<Value> {
        self.call_with_timeout(kind, data, self.config.timeout).await
    }

    /// Call with an explicit deadline.
    pub async fn call_with_timeout(
        &self,
        kind: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let channel = self.broker.acquire().await?;

        // fresh exclusive reply queue, named by the broker, torn down
        // with its consumer
        let reply_queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Transport(format!("failed to declare reply queue: {}", e))
            })?;
        let reply_queue = reply_queue.name().as_str().to_string();

        let token = Uuid::new_v4().to_string();
        let rx = self.pending.register(&token).await;
        let consumer_tag = format!("rpc-client-{}", token);

        let outcome = self
            .dispatch(&channel, &reply_queue, &consumer_tag, &token, kind, &data)
            .await;

        if let Err(err) = outcome {
            // never leave a pending entry or reply consumer behind
            self.pending.forget(&token).await;
            let _ = channel
                .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                .await;
            return Err(err);
        }

        let result = tokio::time::timeout(timeout, rx).await;

        let _ = channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await;

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(BrokerError::Transport(
                "reply completion dropped".to_string(),
            )),
            Err(_elapsed) => {
                self.pending.forget(&token).await;
                let err = BrokerError::Timeout {
                    queue: self.config.queue.clone(),
                    kind: kind.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                let tags = ReportTags::new(StreamKind::RpcClient)
                    .with_queue(&self.config.queue)
                    .with_message_type(kind)
                    .with_correlation_id(&token)
                    .with_context(&context::current());
                let request = serde_json::json!({"type": kind, "data": data});
                self.reporter.report(&err, tags, Some(&request));
                Err(err)
            }
        }
    }

    /// Start the reply consumer and publish the request. Failures here
    /// are cleaned up by the caller.
    async fn dispatch(
        &self,
        channel: &Channel,
        reply_queue: &str,
        consumer_tag: &str,
        token: &str,
        kind: &str,
        data: &Value,
    ) -> Result<()> {
        let consumer = channel
            .basic_consume(
                reply_queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Transport(format!("failed to consume reply queue: {}", e))
            })?;

        tokio::spawn(reply_pump(
            consumer,
            token.to_string(),
            self.pending.clone(),
            self.reporter.clone(),
            ReportTags::new(StreamKind::RpcClient)
                .with_queue(&self.config.queue)
                .with_message_type(kind)
                .with_correlation_id(token)
                .with_context(&context::current()),
        ));

        let payload = Envelope::new(kind, data.clone()).to_bytes()?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_correlation_id(token.into())
            .with_reply_to(reply_queue.into())
            .with_headers(context::inject_headers());

        let confirm = channel
            .basic_publish(
                "",
                &self.config.queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| {
                BrokerError::Transport(format!(
                    "failed to publish rpc request to '{}': {}",
                    self.config.queue, e
                ))
            })?;

        confirm.await.map_err(|e| {
            BrokerError::Transport(format!("rpc request confirmation failed: {}", e))
        })?;

        debug!(
            queue = %self.config.queue,
            kind = %kind,
            correlation_id = %token,
            "dispatched rpc request"
        );

        Ok(())
    }
}

/// Consume the reply queue until the matching reply arrives. Messages
/// whose correlation id does not match are discarded.
async fn reply_pump(
    mut consumer: lapin::Consumer,
    token: String,
    pending: Arc<PendingReplies>,
    reporter: Arc<dyn ErrorReporter>,
    tags: ReportTags,
) {
    while let Some(delivery) = consumer.next().await {
        let Ok(delivery) = delivery else {
            break;
        };

        let matches = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|correlation| correlation.as_str() == token)
            .unwrap_or(false);
        if !matches {
            continue;
        }

        let result = match serde_json::from_slice::<Value>(&delivery.data) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let err = BrokerError::Protocol(format!("invalid rpc reply: {}", e));
                let raw = Value::String(String::from_utf8_lossy(&delivery.data).into_owned());
                reporter.report(&err, tags.clone(), Some(&raw));
                Err(err)
            }
        };

        pending.complete(&token, result).await;
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_client_config_defaults() {
        let config = RpcClientConfig::new("post-rpc");
        assert_eq!(config.queue, "post-rpc");
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_rpc_client_config_timeout_override() {
        let config = RpcClientConfig::new("post-rpc").with_timeout(Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_millis(250));
    }
}

/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use std::time::Instant;

    use async_trait::async_trait;

    use super::*;
    use crate::broker::{RpcHandler, RpcServer, RpcServerConfig};
    use crate::context::ContextData;
    use crate::report::LogReporter;
    use crate::test_utils::amqp_url;

    /// Permission-check handler: allows everything.
    struct AllowHandler;

    #[async_trait]
    impl RpcHandler for AllowHandler {
        async fn handle(&self, kind: &str, _data: Value) -> Result<Value> {
            match kind {
                "canCreatePost" => Ok(serde_json::json!({"allowed": true})),
                _ => Ok(serde_json::json!({"allowed": false, "reason": "unknown rpc type"})),
            }
        }
    }

    /// Handler that never replies in time.
    struct HangingHandler;

    #[async_trait]
    impl RpcHandler for HangingHandler {
        async fn handle(&self, _kind: &str, _data: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    /// Echoes the request payload and the ambient request id.
    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, _kind: &str, data: Value) -> Result<Value> {
            Ok(serde_json::json!({
                "echo": data,
                "request_id": crate::context::request_id(),
            }))
        }
    }

    /// Handler that always faults.
    struct FaultyHandler;

    #[async_trait]
    impl RpcHandler for FaultyHandler {
        async fn handle(&self, _kind: &str, _data: Value) -> Result<Value> {
            Err(BrokerError::Handler("database on fire".to_string()))
        }
    }

    async fn start_server(queue: &str, handler: Arc<dyn RpcHandler>) -> Arc<Broker> {
        let broker = Arc::new(Broker::new(amqp_url()));
        let server = RpcServer::new(
            broker.clone(),
            Arc::new(LogReporter),
            RpcServerConfig::new(queue),
            handler,
        );
        server.start().await.unwrap();
        broker
    }

    fn client(broker: Arc<Broker>, queue: &str) -> RpcClient {
        RpcClient::new(
            broker,
            Arc::new(LogReporter),
            RpcClientConfig::new(queue),
        )
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_call_resolves_with_handler_reply() {
        let queue = format!("courier-test-rpc-{}", Uuid::new_v4());
        let broker = start_server(&queue, Arc::new(AllowHandler)).await;

        let reply = client(broker, &queue)
            .call("canCreatePost", serde_json::json!({"userId": 42}))
            .await
            .unwrap();

        assert_eq!(reply, serde_json::json!({"allowed": true}));
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_call_times_out_no_earlier_than_deadline() {
        let queue = format!("courier-test-hang-{}", Uuid::new_v4());
        let broker = start_server(&queue, Arc::new(HangingHandler)).await;

        let timeout = Duration::from_millis(1500);
        let started = Instant::now();
        let err = client(broker, &queue)
            .call_with_timeout("canCreatePost", serde_json::json!({"userId": 42}), timeout)
            .await
            .unwrap_err();

        assert!(started.elapsed() >= timeout);
        assert!(matches!(err, BrokerError::Timeout { .. }));
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_concurrent_calls_resolve_one_to_one() {
        let queue = format!("courier-test-pair-{}", Uuid::new_v4());
        let broker = start_server(&queue, Arc::new(EchoHandler)).await;
        let client = Arc::new(client(broker, &queue));

        let mut handles = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let reply = client
                    .call("echo", serde_json::json!({"n": i}))
                    .await
                    .unwrap();
                (i, reply)
            }));
        }

        for handle in handles {
            let (i, reply) = handle.await.unwrap();
            assert_eq!(reply["echo"], serde_json::json!({"n": i}));
        }
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_context_round_trips_through_headers() {
        let queue = format!("courier-test-ctx-{}", Uuid::new_v4());
        let broker = start_server(&queue, Arc::new(EchoHandler)).await;
        let client = client(broker, &queue);

        let ctx = ContextData::new().with_request_id("req-round-trip");
        let reply = context::scope(ctx, async {
            client.call("echo", Value::Null).await.unwrap()
        })
        .await;
        assert_eq!(reply["request_id"], serde_json::json!("req-round-trip"));

        // without ambient context no request_id header is propagated
        let reply = client.call("echo", Value::Null).await.unwrap();
        assert_eq!(reply["request_id"], Value::Null);
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_handler_fault_yields_safe_error_reply() {
        let queue = format!("courier-test-fault-{}", Uuid::new_v4());
        let broker = start_server(&queue, Arc::new(FaultyHandler)).await;

        let reply = client(broker, &queue)
            .call("anything", Value::Null)
            .await
            .unwrap();

        // the client gets the fixed reply, not the internal failure
        assert_eq!(
            reply,
            serde_json::json!({"ok": false, "reason": "internal error"})
        );
    }
}
