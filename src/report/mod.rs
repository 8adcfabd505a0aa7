//! Observability collaborator boundary.
//!
//! Every error caught in the messaging layer is reported through an
//! [`ErrorReporter`] with tags identifying the stream kind, queue,
//! message type, correlation token and ambient request/actor ids, plus
//! the raw payload as context. Reporting is a required side effect of
//! the error-handling contract, not optional logging; the sink's
//! internals (Sentry, OTLP, ...) are out of scope behind this trait.

use lapin::BasicProperties;
use serde_json::Value;
use tracing::error;

use crate::broker::{BrokerError, Envelope};
use crate::context::{self, ContextData};

/// Which messaging surface produced the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Fire-and-forget publisher.
    Producer,
    /// Event consumer.
    Event,
    /// RPC server.
    Rpc,
    /// RPC client.
    RpcClient,
}

impl StreamKind {
    /// Stable tag value for this surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Producer => "producer",
            StreamKind::Event => "event",
            StreamKind::Rpc => "rpc",
            StreamKind::RpcClient => "rpc-client",
        }
    }
}

/// Tags attached to a report.
#[derive(Debug, Clone)]
pub struct ReportTags {
    /// Messaging surface.
    pub kind: StreamKind,
    /// Queue involved, when known.
    pub queue: Option<String>,
    /// Envelope type tag, when the message parsed far enough to have one.
    pub message_type: Option<String>,
    /// Correlation token for RPC traffic.
    pub correlation_id: Option<String>,
    /// Ambient request id.
    pub request_id: Option<String>,
    /// Ambient actor id.
    pub actor_id: Option<String>,
}

impl ReportTags {
    /// Start a tag set for a surface.
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            queue: None,
            message_type: None,
            correlation_id: None,
            request_id: None,
            actor_id: None,
        }
    }

    /// Tag the queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Tag the envelope type.
    pub fn with_message_type(mut self, kind: impl Into<String>) -> Self {
        self.message_type = Some(kind.into());
        self
    }

    /// Tag the correlation token.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Tag the ambient request/actor ids from a context record.
    pub fn with_context(mut self, ctx: &ContextData) -> Self {
        self.request_id = ctx.request_id.clone();
        self.actor_id = ctx.actor_id.clone();
        self
    }

    /// Build the tag set for a delivered message: context ids from the
    /// headers, correlation id from the properties, type tag from the
    /// envelope when it parsed.
    pub(crate) fn from_delivery(
        kind: StreamKind,
        queue: &str,
        properties: &BasicProperties,
        envelope: Option<&Envelope>,
    ) -> Self {
        let mut tags = Self::new(kind)
            .with_queue(queue)
            .with_context(&context::from_properties(properties));
        if let Some(correlation) = properties.correlation_id() {
            tags.correlation_id = Some(correlation.as_str().to_string());
        }
        if let Some(envelope) = envelope {
            tags.message_type = Some(envelope.kind.clone());
        }
        tags
    }
}

/// Sink for caught messaging-layer errors.
pub trait ErrorReporter: Send + Sync {
    /// Report one error with its tags and raw payload.
    fn report(&self, error: &BrokerError, tags: ReportTags, payload: Option<&Value>);
}

/// Default reporter emitting a structured tracing record.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &BrokerError, tags: ReportTags, payload: Option<&Value>) {
        error!(
            kind = tags.kind.as_str(),
            queue = tags.queue.as_deref().unwrap_or_default(),
            message_type = tags.message_type.as_deref().unwrap_or_default(),
            correlation_id = tags.correlation_id.as_deref().unwrap_or_default(),
            request_id = tags.request_id.as_deref().unwrap_or_default(),
            user_id = tags.actor_id.as_deref().unwrap_or_default(),
            payload = %payload.map(|v| v.to_string()).unwrap_or_default(),
            error = %error,
            "messaging operation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_tags() {
        assert_eq!(StreamKind::Producer.as_str(), "producer");
        assert_eq!(StreamKind::Event.as_str(), "event");
        assert_eq!(StreamKind::Rpc.as_str(), "rpc");
        assert_eq!(StreamKind::RpcClient.as_str(), "rpc-client");
    }

    #[test]
    fn test_tags_from_delivery() {
        let ctx = ContextData::new()
            .with_request_id("req-9")
            .with_actor_id("3");
        let properties = BasicProperties::default()
            .with_correlation_id("corr-1".into())
            .with_headers(context::headers_from(&ctx));
        let envelope = Envelope::new("post.created", Value::Null);

        let tags = ReportTags::from_delivery(
            StreamKind::Event,
            "post-events",
            &properties,
            Some(&envelope),
        );

        assert_eq!(tags.queue.as_deref(), Some("post-events"));
        assert_eq!(tags.message_type.as_deref(), Some("post.created"));
        assert_eq!(tags.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(tags.request_id.as_deref(), Some("req-9"));
        assert_eq!(tags.actor_id.as_deref(), Some("3"));
    }

    #[test]
    fn test_tags_builders() {
        let tags = ReportTags::new(StreamKind::RpcClient)
            .with_queue("post-rpc")
            .with_message_type("canCreatePost")
            .with_correlation_id("abc");
        assert_eq!(tags.kind, StreamKind::RpcClient);
        assert_eq!(tags.queue.as_deref(), Some("post-rpc"));
        assert!(tags.request_id.is_none());
    }
}
