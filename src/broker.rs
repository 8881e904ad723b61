// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! The injected dispatch abstraction.
//!
//! A [`Broker`] is whatever actually resolves an action/event name and moves
//! bytes: local invocation, a transport, a test double. Contexts only require
//! the "invoke an action or event, get a settled result back" primitive plus
//! the child [`Context`](crate::context::Context) each dispatch ran with, so
//! that meta can be merged bottom-up after settlement.

use crate::context::Context;
use crate::error::StarError;
use crate::trace::{Span, Tracer};
use faststr::FastStr;
use futures::future::BoxFuture;
use rand::RngCore;
use serde_json::{Map, Value};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

/// Generates a uuid-shaped random identifier.
///
/// Used for context ids, request ids and span ids; exporters may truncate it
/// (Zipkin keeps the first 16 hex chars after stripping dashes).
pub fn generate_uid() -> FastStr {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        // infallible on String
        let _ = write!(out, "{b:02x}");
    }
    FastStr::new(out)
}

/// Broker-wide options consumed by the context guards.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct BrokerOptions {
    /// Maximum call-chain depth; `0` disables the guard.
    pub max_call_level: u32,
    /// Whether `params` are deep-cloned into each new context by default,
    /// protecting caller-owned data from downstream mutation.
    pub context_params_cloning: bool,
}

impl BrokerOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the maximum call-chain depth (`0` disables the guard).
    pub fn with_max_call_level(mut self, max_call_level: u32) -> Self {
        self.max_call_level = max_call_level;
        self
    }

    /// Sets the default params-cloning behavior.
    pub fn with_context_params_cloning(mut self, cloning: bool) -> Self {
        self.context_params_cloning = cloning;
        self
    }
}

/// Event delivery groups, as given by the caller.
///
/// `emit`/`broadcast` accept a single group name or a list; contexts
/// normalize either shape into a list before delegating.
#[derive(Debug, Clone)]
pub enum Groups {
    /// A single group name.
    One(FastStr),
    /// An explicit list of group names.
    Many(Vec<FastStr>),
}

impl Groups {
    /// Normalizes into a list of group names.
    pub fn into_vec(self) -> Vec<FastStr> {
        match self {
            Groups::One(group) => vec![group],
            Groups::Many(groups) => groups,
        }
    }
}

impl From<&'static str> for Groups {
    fn from(group: &'static str) -> Self {
        Groups::One(group.into())
    }
}

impl From<Vec<FastStr>> for Groups {
    fn from(groups: Vec<FastStr>) -> Self {
        Groups::Many(groups)
    }
}

/// Per-call options, inherited and narrowable along the chain.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct CallOptions {
    /// Timeout budget for this call; narrowed to the remaining parent budget.
    pub timeout: Option<Duration>,
    /// Retry count hint for the dispatcher.
    pub retries: Option<u32>,
    /// Explicit request id, overriding inheritance from the parent.
    pub request_id: Option<FastStr>,
    /// Explicit meta entries, merged over the inherited parent meta.
    pub meta: Option<Map<String, Value>>,
    /// Explicit caller (service full name), overriding the parent's.
    pub caller: Option<FastStr>,
    /// Per-call override of the broker-wide params-cloning default.
    pub params_cloning: Option<bool>,
    /// Event delivery groups.
    pub groups: Option<Groups>,
    /// Parent span for externally resumed traces, bypassing a parent context.
    pub parent_span: Option<Span>,
}

impl CallOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the timeout budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry count hint.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Sets an explicit request id.
    pub fn with_request_id(mut self, request_id: impl Into<FastStr>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets explicit meta entries.
    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Sets an explicit caller name.
    pub fn with_caller(mut self, caller: impl Into<FastStr>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Overrides the params-cloning default for this call.
    pub fn with_params_cloning(mut self, cloning: bool) -> Self {
        self.params_cloning = Some(cloning);
        self
    }

    /// Sets the event delivery groups.
    pub fn with_groups(mut self, groups: impl Into<Groups>) -> Self {
        self.groups = Some(groups.into());
        self
    }

    /// Sets the parent span for an externally resumed trace.
    pub fn with_parent_span(mut self, span: Span) -> Self {
        self.parent_span = Some(span);
        self
    }
}

/// One branch of an [`mcall`](crate::context::Context::mcall) batch.
#[derive(Debug, Clone)]
pub struct McallEntry {
    /// Action to call.
    pub action: FastStr,
    /// Call params.
    pub params: Value,
    /// Per-branch options.
    pub options: CallOptions,
}

impl McallEntry {
    /// Creates a batch entry with default options.
    pub fn new(action: impl Into<FastStr>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
            options: Default::default(),
        }
    }

    /// Sets per-branch options.
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }
}

/// Batch definition: an ordered list or a named mapping of entries.
///
/// Definition order is the deterministic contract for both result order and
/// meta merge order, regardless of branch completion order.
#[derive(Debug, Clone)]
pub enum McallDef {
    /// Ordered list of branches.
    List(Vec<McallEntry>),
    /// Named mapping of branches, in definition order.
    Named(Vec<(FastStr, McallEntry)>),
}

impl McallDef {
    /// Iterates the entries in definition order.
    pub fn entries(&self) -> impl Iterator<Item = &McallEntry> {
        match self {
            McallDef::List(entries) => {
                Box::new(entries.iter()) as Box<dyn Iterator<Item = &McallEntry> + '_>
            }
            McallDef::Named(entries) => Box::new(entries.iter().map(|(_, entry)| entry)),
        }
    }

    /// Number of branches.
    pub fn len(&self) -> usize {
        match self {
            McallDef::List(entries) => entries.len(),
            McallDef::Named(entries) => entries.len(),
        }
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joined action names, used by the skipped-call error.
    pub fn action_names(&self) -> String {
        let mut out = String::new();
        for (i, entry) in self.entries().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&entry.action);
        }
        out
    }
}

/// Settled outcome of a single dispatch.
///
/// `ctx` is the child context the dispatcher actually ran the call with, so
/// the parent can merge its meta after settlement, on failure too.
#[derive(Debug)]
pub struct DispatchedCall {
    /// The call outcome, passed through unchanged.
    pub result: Result<Value, StarError>,
    /// The executed child context, if one was created.
    pub ctx: Option<Context>,
}

/// Settled outcome of a batch dispatch.
#[derive(Debug)]
pub struct DispatchedBatch {
    /// The combined batch outcome; per-branch combination semantics
    /// (fail-fast, partial results) belong to the dispatcher.
    pub result: Result<Value, StarError>,
    /// One executed child context per branch, in definition order.
    pub ctxs: Vec<Context>,
}

/// The injected dispatcher every context delegates to.
///
/// Implementations own endpoint resolution, transport and retry policy; the
/// context layer owns the guards and propagation semantics layered on top.
pub trait Broker: Send + Sync + 'static {
    /// Id of the local node.
    fn node_id(&self) -> FastStr;

    /// Generates a unique id for contexts and requests.
    fn generate_uid(&self) -> FastStr {
        generate_uid()
    }

    /// Broker-wide options consumed by the context guards.
    fn options(&self) -> &BrokerOptions;

    /// The tracer owned by this broker.
    fn tracer(&self) -> Arc<Tracer>;

    /// Dispatches a single action call issued from `parent`.
    fn call<'a>(
        &'a self,
        parent: &'a Context,
        action: FastStr,
        params: Arc<Value>,
        opts: CallOptions,
    ) -> BoxFuture<'a, DispatchedCall>;

    /// Dispatches a batch of calls issued from `parent`. Branches run
    /// concurrently; results and contexts come back in definition order.
    fn mcall<'a>(
        &'a self,
        parent: &'a Context,
        defs: McallDef,
        opts: CallOptions,
    ) -> BoxFuture<'a, DispatchedBatch>;

    /// Fire-and-forget balanced event emission.
    fn emit<'a>(
        &'a self,
        parent: &'a Context,
        event: FastStr,
        data: Value,
        opts: CallOptions,
    ) -> BoxFuture<'a, Result<(), StarError>>;

    /// Fire-and-forget broadcast to every node.
    fn broadcast<'a>(
        &'a self,
        parent: &'a Context,
        event: FastStr,
        data: Value,
        opts: CallOptions,
    ) -> BoxFuture<'a, Result<(), StarError>>;
}
