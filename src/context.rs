// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Per-call envelope carried along every dispatch chain.
//!
//! A [`Context`] binds one action call or event delivery: correlation ids,
//! call depth, the timeout budget, `params`, shared `meta` and the span stack.
//! Child contexts are derived from their parent at dispatch time; after a
//! child settles its meta is merged back into the parent, so downstream
//! mutations survive the return path even when the call itself failed.

use crate::broker::{Broker, CallOptions, Groups, McallDef};
use crate::endpoint::{Endpoint, ServiceInfo};
use crate::error::StarError;
use crate::trace::{Span, SpanOptions};
use dashmap::DashMap;
use faststr::FastStr;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::warn;

/// How an event context was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Balanced emission to one consumer per group.
    Emit,
    /// Delivery to every node.
    Broadcast,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Emit => "emit",
            EventType::Broadcast => "broadcast",
        }
    }
}

/// The per-call envelope.
///
/// `meta` is shared mutable state: a child gets its own map seeded from the
/// parent at creation, and the parent absorbs the child's entries once the
/// dispatch settles. `params` travel behind an `Arc` and are deep-cloned only
/// when params cloning is requested.
#[derive(Clone)]
pub struct Context {
    broker: Arc<dyn Broker>,
    id: FastStr,
    request_id: FastStr,
    parent_id: Option<FastStr>,
    node_id: Option<FastStr>,
    endpoint: Option<Endpoint>,
    event_name: Option<FastStr>,
    event_type: Option<EventType>,
    event_groups: Vec<FastStr>,
    options: CallOptions,
    caller: Option<FastStr>,
    level: u32,
    params: Arc<Value>,
    meta: Arc<DashMap<String, Value>>,
    tracing: Option<bool>,
    span: Option<Span>,
    span_stack: Vec<Span>,
    start_time: Option<Instant>,
}

impl Context {
    /// Creates a bare envelope at level 1 with a fresh id that doubles as
    /// the request id until a parent or an explicit option says otherwise.
    pub fn new(broker: Arc<dyn Broker>, endpoint: Option<Endpoint>) -> Self {
        let id = broker.generate_uid();
        let node_id = broker.node_id();
        let mut ctx = Self {
            broker,
            request_id: id.clone(),
            id,
            parent_id: None,
            node_id: Some(node_id),
            endpoint: None,
            event_name: None,
            event_type: None,
            event_groups: Vec::new(),
            options: CallOptions::new(),
            caller: None,
            level: 1,
            params: Arc::new(Value::Null),
            meta: Arc::new(DashMap::new()),
            tracing: None,
            span: None,
            span_stack: Vec::new(),
            start_time: None,
        };
        if let Some(endpoint) = endpoint {
            ctx.set_endpoint(endpoint);
        }
        ctx
    }

    /// Derives a dispatch-ready context, inheriting from `parent` when given.
    ///
    /// Inheritance order: parent contributes request id, meta seed, tracing
    /// flag, `level + 1`, parent id (the parent's active span id when one is
    /// open) and caller; explicit `opts` fields win over all of it. An
    /// explicit `opts.parent_span` resumes an external trace, overriding
    /// request id, parent id and the tracing flag from that span.
    pub fn create(
        broker: Arc<dyn Broker>,
        endpoint: Option<Endpoint>,
        params: Arc<Value>,
        opts: CallOptions,
        parent: Option<&Context>,
    ) -> Self {
        let mut ctx = Context::new(broker, endpoint);

        let cloning = opts
            .params_cloning
            .unwrap_or(ctx.broker.options().context_params_cloning);
        ctx.set_params(params, cloning);

        if let Some(parent) = parent {
            ctx.request_id = parent.request_id.clone();
            ctx.level = parent.level + 1;
            ctx.tracing = parent.tracing;
            ctx.parent_id = match &parent.span {
                Some(span) => Some(span.id()),
                None => Some(parent.id.clone()),
            };
            ctx.caller = parent.service().map(|svc| svc.full_name.clone());
            for entry in parent.meta.iter() {
                ctx.meta.insert(entry.key().clone(), entry.value().clone());
            }
        }

        if let Some(request_id) = &opts.request_id {
            ctx.request_id = request_id.clone();
        }
        if let Some(meta) = &opts.meta {
            for (key, value) in meta {
                ctx.meta.insert(key.clone(), value.clone());
            }
        }
        if let Some(caller) = &opts.caller {
            ctx.caller = Some(caller.clone());
        }
        if let Some(span) = &opts.parent_span {
            ctx.request_id = span.trace_id();
            ctx.parent_id = Some(span.id());
            ctx.tracing = Some(span.sampled());
        }

        ctx.options = opts;
        ctx
    }

    /// Shallow copy under a new id: options, meta, params and the current
    /// span stay shared by reference, the span stack starts empty, and the
    /// given endpoint rebinds the copy.
    pub fn copy(&self, endpoint: Option<Endpoint>) -> Self {
        let mut ctx = self.clone();
        ctx.id = self.broker.generate_uid();
        ctx.span_stack = Vec::new();
        if let Some(endpoint) = endpoint {
            ctx.set_endpoint(endpoint);
        }
        ctx
    }

    /// Binds `params`, deep-cloning them out of the shared `Arc` when
    /// `cloning` is set.
    pub fn set_params(&mut self, params: Arc<Value>, cloning: bool) {
        self.params = if cloning {
            Arc::new((*params).clone())
        } else {
            params
        };
    }

    /// Rebinds the endpoint; the endpoint's node wins over the local node id.
    pub fn set_endpoint(&mut self, endpoint: Endpoint) {
        self.node_id = Some(endpoint.id.clone());
        self.endpoint = Some(endpoint);
    }

    /// Marks this context as an event delivery.
    pub fn set_event_data(
        &mut self,
        event_name: impl Into<FastStr>,
        event_type: EventType,
        groups: Vec<FastStr>,
    ) {
        self.event_name = Some(event_name.into());
        self.event_type = Some(event_type);
        self.event_groups = groups;
    }

    /// Stamps the dispatch start instant, the basis of budget math.
    pub fn set_start_time(&mut self, start_time: Instant) {
        self.start_time = Some(start_time);
    }

    fn remaining_budget(&self) -> Option<Duration> {
        match (self.options.timeout, self.start_time) {
            (Some(timeout), Some(start)) => Some(timeout.saturating_sub(start.elapsed())),
            _ => None,
        }
    }

    fn merge_meta_from(&self, child: &Context) {
        if Arc::ptr_eq(&self.meta, &child.meta) {
            return;
        }
        for entry in child.meta.iter() {
            self.meta.insert(entry.key().clone(), entry.value().clone());
        }
    }

    /// Calls an action from this context.
    ///
    /// Guards run before any dispatch: an exhausted timeout budget settles
    /// into [`StarError::RequestSkipped`] without touching the broker, an
    /// unexhausted budget narrows the child timeout to what remains, and a
    /// chain at `max_call_level` settles into [`StarError::MaxCallLevel`].
    /// After settlement the executed child's meta is merged into this
    /// context, on failure too, and the outcome passes through unchanged.
    pub async fn call(
        &self,
        action: impl Into<FastStr>,
        params: Value,
        opts: CallOptions,
    ) -> Result<Value, StarError> {
        let action = action.into();
        let mut opts = opts;

        if let Some(remaining) = self.remaining_budget() {
            if remaining.is_zero() {
                return Err(StarError::RequestSkipped {
                    action,
                    node_id: self.broker.node_id(),
                });
            }
            opts.timeout = Some(match opts.timeout {
                Some(timeout) if timeout < remaining => timeout,
                _ => remaining,
            });
        }

        let max_call_level = self.broker.options().max_call_level;
        if max_call_level > 0 && self.level >= max_call_level {
            return Err(StarError::MaxCallLevel {
                node_id: self.broker.node_id(),
                level: self.level,
            });
        }

        let dispatched = self
            .broker
            .call(self, action, Arc::new(params), opts)
            .await;
        if let Some(ctx) = &dispatched.ctx {
            self.merge_meta_from(ctx);
        }
        dispatched.result
    }

    /// Calls a batch of actions from this context.
    ///
    /// The budget and depth guards of [`Context::call`] apply once to the
    /// whole batch; the skipped-call error names the joined action list.
    /// Meta from every executed branch merges back in definition order,
    /// whatever order the branches completed in, success or failure alike.
    pub async fn mcall(&self, defs: McallDef, opts: CallOptions) -> Result<Value, StarError> {
        let mut opts = opts;

        if let Some(remaining) = self.remaining_budget() {
            if remaining.is_zero() {
                return Err(StarError::RequestSkipped {
                    action: FastStr::new(defs.action_names()),
                    node_id: self.broker.node_id(),
                });
            }
            opts.timeout = Some(match opts.timeout {
                Some(timeout) if timeout < remaining => timeout,
                _ => remaining,
            });
        }

        let max_call_level = self.broker.options().max_call_level;
        if max_call_level > 0 && self.level >= max_call_level {
            return Err(StarError::MaxCallLevel {
                node_id: self.broker.node_id(),
                level: self.level,
            });
        }

        let dispatched = self.broker.mcall(self, defs, opts).await;
        for ctx in &dispatched.ctxs {
            self.merge_meta_from(ctx);
        }
        dispatched.result
    }

    /// Emits a balanced event from this context. Event delivery carries no
    /// depth or budget guard.
    pub async fn emit(
        &self,
        event: impl Into<FastStr>,
        data: Value,
        opts: CallOptions,
    ) -> Result<(), StarError> {
        let mut opts = opts;
        if let Some(groups) = opts.groups.take() {
            opts.groups = Some(Groups::Many(groups.into_vec()));
        }
        self.broker.emit(self, event.into(), data, opts).await
    }

    /// Broadcasts an event from this context to every node.
    pub async fn broadcast(
        &self,
        event: impl Into<FastStr>,
        data: Value,
        opts: CallOptions,
    ) -> Result<(), StarError> {
        let mut opts = opts;
        if let Some(groups) = opts.groups.take() {
            opts.groups = Some(Groups::Many(groups.into_vec()));
        }
        self.broker.broadcast(self, event.into(), data, opts).await
    }

    /// Opens a span tied to this context and makes it current.
    ///
    /// Nests under the currently open span when there is one; otherwise the
    /// root span joins the context's trace (trace id = request id, parent id
    /// = this context's parent id, service from the endpoint, sampling from
    /// the propagated tracing flag). Explicit `opts` fields win.
    pub fn start_span(&mut self, name: impl Into<FastStr>, opts: SpanOptions) -> Span {
        let span = match &self.span {
            Some(current) => current.start_span(name, opts),
            None => {
                let mut opts = opts;
                if opts.trace_id.is_none() {
                    opts.trace_id = Some(self.request_id.clone());
                }
                if opts.parent_id.is_none() {
                    opts.parent_id = self.parent_id.clone();
                }
                if opts.service.is_none() {
                    opts.service = self.endpoint.as_ref().map(|ep| ep.service().clone());
                }
                if opts.sampled.is_none() {
                    opts.sampled = self.tracing;
                }
                self.broker.tracer().start_span(name, opts)
            }
        };
        self.span_stack.push(span.clone());
        self.span = Some(span.clone());
        span
    }

    /// Finishes a span opened on this context and restores the previous one
    /// as current.
    ///
    /// Matching is by span identity, not name. An already finished span is a
    /// no-op; a span that was never on this context's stack leaves the stack
    /// untouched and logs a warning.
    pub fn finish_span(&mut self, span: &Span, time: Option<SystemTime>) {
        if !span.is_active() {
            return;
        }
        span.finish(time);
        match self.span_stack.iter().rposition(|s| s.same_span(span)) {
            Some(pos) => {
                self.span_stack.remove(pos);
                self.span = self.span_stack.last().cloned();
            }
            None => {
                warn!(
                    "[STARMESH] span '{}' is not assigned to context '{}'",
                    span.name(),
                    self.id
                );
            }
        }
    }

    /// Context id.
    pub fn id(&self) -> &FastStr {
        &self.id
    }

    /// Request id, stable across the whole call chain.
    pub fn request_id(&self) -> &FastStr {
        &self.request_id
    }

    /// Id of the parent context or span, if any.
    pub fn parent_id(&self) -> Option<&FastStr> {
        self.parent_id.as_ref()
    }

    /// Node the bound endpoint lives on, or the local node.
    pub fn node_id(&self) -> Option<&FastStr> {
        self.node_id.as_ref()
    }

    /// The bound endpoint, if any.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Service owning the bound endpoint, if any.
    pub fn service(&self) -> Option<&ServiceInfo> {
        self.endpoint.as_ref().map(|ep| ep.service())
    }

    /// Fully qualified action name, when bound to an action.
    pub fn action_name(&self) -> Option<&FastStr> {
        self.endpoint
            .as_ref()
            .and_then(|ep| ep.action_schema())
            .map(|action| &action.name)
    }

    /// Event name, when this context delivers an event.
    pub fn event_name(&self) -> Option<&FastStr> {
        self.event_name.as_ref()
    }

    /// Event delivery kind, when this context delivers an event.
    pub fn event_type(&self) -> Option<EventType> {
        self.event_type
    }

    /// Event delivery groups.
    pub fn event_groups(&self) -> &[FastStr] {
        &self.event_groups
    }

    /// The call options this context was created with.
    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    /// Full name of the calling service, if any.
    pub fn caller(&self) -> Option<&FastStr> {
        self.caller.as_ref()
    }

    /// Depth in the call chain; the root sits at 1.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Call params.
    pub fn params(&self) -> &Arc<Value> {
        &self.params
    }

    /// Shared meta map.
    pub fn meta(&self) -> &Arc<DashMap<String, Value>> {
        &self.meta
    }

    /// Propagated sampling decision, if one was made upstream.
    pub fn tracing(&self) -> Option<bool> {
        self.tracing
    }

    /// Overrides the propagated sampling decision.
    pub fn set_tracing(&mut self, tracing: bool) {
        self.tracing = Some(tracing);
    }

    /// The currently open span, if any.
    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    /// Dispatch start instant, when the dispatcher stamped one.
    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    /// The broker this context dispatches through.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Explicit field-selection projection, stable against struct growth.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("id".into(), Value::String(self.id.to_string()));
        out.insert(
            "request_id".into(),
            Value::String(self.request_id.to_string()),
        );
        out.insert(
            "parent_id".into(),
            self.parent_id
                .as_ref()
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null),
        );
        out.insert(
            "node_id".into(),
            self.node_id
                .as_ref()
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null),
        );
        out.insert(
            "action".into(),
            self.action_name()
                .map(|name| Value::String(name.to_string()))
                .unwrap_or(Value::Null),
        );
        out.insert(
            "event".into(),
            self.event_name
                .as_ref()
                .map(|name| Value::String(name.to_string()))
                .unwrap_or(Value::Null),
        );
        out.insert(
            "event_type".into(),
            self.event_type
                .map(|t| Value::String(t.as_str().into()))
                .unwrap_or(Value::Null),
        );
        out.insert(
            "caller".into(),
            self.caller
                .as_ref()
                .map(|caller| Value::String(caller.to_string()))
                .unwrap_or(Value::Null),
        );
        out.insert("level".into(), Value::from(self.level));
        out.insert("params".into(), (*self.params).clone());
        let mut meta = Map::new();
        for entry in self.meta.iter() {
            meta.insert(entry.key().clone(), entry.value().clone());
        }
        out.insert("meta".into(), Value::Object(meta));
        out.insert(
            "tracing".into(),
            self.tracing.map(Value::Bool).unwrap_or(Value::Null),
        );
        out.insert(
            "span_id".into(),
            self.span
                .as_ref()
                .map(|span| Value::String(span.id().to_string()))
                .unwrap_or(Value::Null),
        );
        Value::Object(out)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context {}", self.to_json())
    }
}
