//! Ambient per-unit-of-work request context.
//!
//! A task-local record carrying the request id and acting user for the
//! current logical unit of work. Within a process it propagates
//! implicitly through everything awaited inside a [`scope`]; across
//! broker hops it is serialized into message headers by the producers
//! and rebuilt from them by the consumers. It is never shared by
//! reference across processes and never persisted.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;

use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;

/// Header carrying the request id across broker hops.
pub const REQUEST_ID_HEADER: &str = "request_id";
/// Header carrying the acting user id across broker hops.
pub const ACTOR_ID_HEADER: &str = "user_id";

tokio::task_local! {
    static CURRENT: RefCell<ContextData>;
}

/// Snapshot of the ambient context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextData {
    /// Id of the inbound unit of work, if one was assigned.
    pub request_id: Option<String>,
    /// Id of the authenticated actor, if known.
    pub actor_id: Option<String>,
}

impl ContextData {
    /// Create an empty context record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request id.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Set the actor id.
    pub fn with_actor_id(mut self, id: impl Into<String>) -> Self {
        self.actor_id = Some(id.into());
        self
    }
}

/// Run `f` with `initial` as the ambient context.
///
/// The context is visible to everything `f` awaits, but not to tasks it
/// spawns; crossing a task or process boundary requires explicit
/// propagation through message headers.
pub async fn scope<F>(initial: ContextData, f: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(RefCell::new(initial), f).await
}

/// Snapshot the ambient context, empty when no scope is active.
pub fn current() -> ContextData {
    CURRENT
        .try_with(|ctx| ctx.borrow().clone())
        .unwrap_or_default()
}

/// Read the current request id, `None` outside a scope.
pub fn request_id() -> Option<String> {
    CURRENT
        .try_with(|ctx| ctx.borrow().request_id.clone())
        .ok()
        .flatten()
}

/// Write the request id; no-op outside a scope.
pub fn set_request_id(id: impl Into<String>) {
    let _ = CURRENT.try_with(|ctx| ctx.borrow_mut().request_id = Some(id.into()));
}

/// Read the current actor id, `None` outside a scope.
pub fn actor_id() -> Option<String> {
    CURRENT
        .try_with(|ctx| ctx.borrow().actor_id.clone())
        .ok()
        .flatten()
}

/// Write the actor id; no-op outside a scope.
pub fn set_actor_id(id: impl Into<String>) {
    let _ = CURRENT.try_with(|ctx| ctx.borrow_mut().actor_id = Some(id.into()));
}

/// Serialize the ambient context into outgoing message headers.
///
/// Absent fields produce no header at all, never a placeholder.
pub fn inject_headers() -> FieldTable {
    headers_from(&current())
}

/// Serialize a context record into message headers.
pub fn headers_from(ctx: &ContextData) -> FieldTable {
    let mut headers = BTreeMap::new();
    if let Some(id) = &ctx.request_id {
        headers.insert(
            REQUEST_ID_HEADER.into(),
            AMQPValue::LongString(id.as_str().into()),
        );
    }
    if let Some(id) = &ctx.actor_id {
        headers.insert(
            ACTOR_ID_HEADER.into(),
            AMQPValue::LongString(id.as_str().into()),
        );
    }
    FieldTable::from(headers)
}

/// Rebuild a context record from delivered message properties.
pub fn from_properties(properties: &BasicProperties) -> ContextData {
    let mut ctx = ContextData::default();
    if let Some(headers) = properties.headers() {
        ctx.request_id = header_string(headers, REQUEST_ID_HEADER);
        ctx.actor_id = header_string(headers, ACTOR_ID_HEADER);
    }
    ctx
}

fn header_string(headers: &FieldTable, key: &str) -> Option<String> {
    headers.inner().get(key).and_then(|value| match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
            .ok()
            .map(ToString::to_string),
        _ => None,
    })
}
