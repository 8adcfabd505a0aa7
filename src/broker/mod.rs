//! Broker messaging layer.
//!
//! This module contains:
//! - `Envelope`: the `{type, data}` message body used on every queue
//! - `BrokerError`: error taxonomy for transport/protocol/handler faults
//! - `EventHandler` / `RpcHandler` traits: the two handler capabilities
//! - Implementations: shared connection, producer, consumers, RPC

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod connection;
mod consumer;
mod pending;
mod producer;
mod rpc_client;
mod rpc_server;

pub use connection::Broker;
pub use consumer::{EventConsumer, EventConsumerConfig};
pub use producer::Producer;
pub use rpc_client::{RpcClient, RpcClientConfig};
pub use rpc_server::{RpcServer, RpcServerConfig};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur in the messaging layer.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Broker unreachable or a channel operation failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An RPC call received no matching reply within its deadline.
    #[error("rpc call '{kind}' on queue '{queue}' timed out after {timeout_ms}ms")]
    Timeout {
        queue: String,
        kind: String,
        timeout_ms: u64,
    },

    /// A message body that is not a valid envelope. Terminal for that
    /// message, never requeued.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Business-logic failure raised inside a handler. Contained at the
    /// consumer boundary, never propagated to the broker layer.
    #[error("handler failure: {0}")]
    Handler(String),
}

/// Message body convention used on every queue.
///
/// The `type` tag routes dispatch; unknown tags are handed to the
/// handler untouched, never dropped before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Non-empty message type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// JSON payload; `null` when absent on the wire.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Parse an envelope from a raw message body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| BrokerError::Protocol(format!("invalid envelope: {}", e)))?;
        if envelope.kind.is_empty() {
            return Err(BrokerError::Protocol(
                "envelope type must be non-empty".to_string(),
            ));
        }
        Ok(envelope)
    }

    /// Serialize the envelope for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| BrokerError::Protocol(format!("failed to serialize envelope: {}", e)))
    }
}

/// Fire-and-forget handler: processes an event, acknowledged on
/// success, negatively acknowledged on failure.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event. The ambient request context is already
    /// established from the message headers when this runs.
    async fn handle(&self, kind: &str, data: Value) -> Result<()>;
}

/// Request-reply handler: returns a JSON-serializable reply object.
///
/// Expected business outcomes belong in the reply; only true faults
/// should return `Err`.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Produce the reply for one request.
    async fn handle(&self, kind: &str, data: Value) -> Result<Value>;

    /// Fixed caller-safe reply sent when `handle` fails. Never exposes
    /// internal error details.
    fn error_reply(&self) -> Value {
        serde_json::json!({"ok": false, "reason": "internal error"})
    }
}
