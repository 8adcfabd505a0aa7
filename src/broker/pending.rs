//! Pending-reply table for in-flight RPC calls.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use super::Result;

/// Outcome delivered to a waiting caller.
pub(crate) type ReplyResult = Result<Value>;

/// Table of in-flight calls keyed by correlation token.
///
/// Each entry is a single-completion handle: the reply path and the
/// timeout path both race to remove it, and whichever removes it first
/// owns completion — the loser observes a no-op. A token is registered
/// exactly once per call and removed on completion, so entries never
/// leak past the call that created them.
#[derive(Default)]
pub(crate) struct PendingReplies {
    entries: Mutex<HashMap<String, oneshot::Sender<ReplyResult>>>,
}

impl PendingReplies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token and return the receiving half.
    pub(crate) async fn register(&self, token: &str) -> oneshot::Receiver<ReplyResult> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().await.insert(token.to_string(), tx);
        rx
    }

    /// Complete the entry for `token`. Returns whether this call won
    /// the completion race.
    pub(crate) async fn complete(&self, token: &str, result: ReplyResult) -> bool {
        let Some(tx) = self.entries.lock().await.remove(token) else {
            return false;
        };
        // the receiver may already be gone; completion stays a no-op then
        tx.send(result).is_ok()
    }

    /// Drop the entry for `token` without completing it. Returns
    /// whether an entry was still pending.
    pub(crate) async fn forget(&self, token: &str) -> bool {
        self.entries.lock().await.remove(token).is_some()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
