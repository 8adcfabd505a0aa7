//! Request-reply serving.

use std::sync::Arc;

use super::consumer::{start_dispatch, Dispatch};
use super::{Broker, Result, RpcHandler};
use crate::report::ErrorReporter;

/// Default prefetch bound for RPC servers.
pub(crate) const DEFAULT_RPC_PREFETCH: u16 = 5;

/// Configuration for an RPC server.
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    /// Durable request queue.
    pub queue: String,
    /// Maximum unacknowledged requests in flight.
    pub prefetch: u16,
}

impl RpcServerConfig {
    /// Config with the default prefetch (5).
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: DEFAULT_RPC_PREFETCH,
        }
    }

    /// Override the prefetch bound.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }
}

/// Replying counterpart of [`RpcClient`].
///
/// Guarantees exactly one reply per request and acknowledges every
/// request, on the success and failure path alike: nacking an RPC
/// request would only redeliver it to a client that already got its
/// answer or gave up waiting. Handler failures are reported and
/// replaced by the handler's fixed caller-safe error reply.
///
/// [`RpcClient`]: super::RpcClient
pub struct RpcServer {
    broker: Arc<Broker>,
    reporter: Arc<dyn ErrorReporter>,
    config: RpcServerConfig,
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    /// Create a server; nothing happens until [`start`].
    ///
    /// [`start`]: RpcServer::start
    pub fn new(
        broker: Arc<Broker>,
        reporter: Arc<dyn ErrorReporter>,
        config: RpcServerConfig,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        Self {
            broker,
            reporter,
            config,
            handler,
        }
    }

    /// Queue this server answers on.
    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    /// Declare the request queue and begin serving.
    pub async fn start(&self) -> Result<()> {
        let channel = self.broker.acquire().await?;
        start_dispatch(
            channel,
            self.config.queue.clone(),
            self.config.prefetch,
            Arc::new(Dispatch::Rpc {
                handler: self.handler.clone(),
            }),
            self.reporter.clone(),
        )
        .await
    }
}
