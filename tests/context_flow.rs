// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! End-to-end context propagation through a scripted broker: guards, budget
//! narrowing, meta merge-back and span export.

use assert_matches::assert_matches;
use faststr::FastStr;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use starmesh::{
    ActionSchema, Broker, BrokerOptions, CallOptions, Context, DispatchedBatch, DispatchedCall,
    Endpoint, ExporterConfig, Groups, McallDef, McallEntry, ServiceInfo, Span, SpanExporter,
    SpanOptions, StarError, Tracer, TracerOptions,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Scripted in-process dispatcher. Every dispatched call derives a real
/// child context, stamps its meta with `handled_by`, and hands the child
/// back so the caller-side merge path runs exactly as in production.
struct MockBroker {
    this: Weak<MockBroker>,
    options: BrokerOptions,
    tracer: Arc<Tracer>,
    dispatches: AtomicUsize,
    seen_timeouts: Mutex<Vec<Option<Duration>>>,
    last_ctx: Mutex<Option<Context>>,
    // (event, groups-were-normalized-to-a-list, groups)
    events: Mutex<Vec<(FastStr, bool, Vec<FastStr>)>>,
    fail_actions: HashSet<String>,
}

impl MockBroker {
    fn new(options: BrokerOptions) -> Arc<Self> {
        Self::with_tracer(options, Arc::new(Tracer::new(TracerOptions::new())))
    }

    fn with_tracer(options: BrokerOptions, tracer: Arc<Tracer>) -> Arc<Self> {
        Self::build(options, tracer, HashSet::new())
    }

    fn failing(options: BrokerOptions, actions: &[&str]) -> Arc<Self> {
        Self::build(
            options,
            Arc::new(Tracer::new(TracerOptions::new())),
            actions.iter().map(|a| a.to_string()).collect(),
        )
    }

    fn build(
        options: BrokerOptions,
        tracer: Arc<Tracer>,
        fail_actions: HashSet<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            options,
            tracer,
            dispatches: AtomicUsize::new(0),
            seen_timeouts: Mutex::new(Vec::new()),
            last_ctx: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            fail_actions,
        })
    }

    fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    fn last_timeout(&self) -> Option<Duration> {
        *self.seen_timeouts.lock().unwrap().last().unwrap()
    }

    fn last_ctx(&self) -> Context {
        self.last_ctx
            .lock()
            .unwrap()
            .clone()
            .expect("at least one dispatch")
    }

    fn endpoint_for(&self, action: &FastStr) -> Endpoint {
        let service = action.split('.').next().unwrap_or("svc").to_string();
        Endpoint::action(
            self.node_id(),
            ActionSchema::new(action.clone(), ServiceInfo::new(service)),
        )
    }

    fn run_child(
        &self,
        parent: &Context,
        action: &FastStr,
        params: Arc<Value>,
        opts: CallOptions,
    ) -> (Context, Result<Value, StarError>) {
        let broker: Arc<dyn Broker> = self.this.upgrade().expect("broker alive");
        let mut child = Context::create(
            broker,
            Some(self.endpoint_for(action)),
            params,
            opts,
            Some(parent),
        );
        child.set_start_time(Instant::now());
        child
            .meta()
            .insert("handled_by".into(), Value::String(action.to_string()));
        child
            .meta()
            .insert(format!("seen.{action}"), Value::Bool(true));
        let result = if self.fail_actions.contains(action.as_str()) {
            Err(StarError::ServerError {
                message: format!("scripted failure in '{action}'"),
            })
        } else {
            Ok(json!({ "ok": action.as_str() }))
        };
        (child, result)
    }
}

impl Broker for MockBroker {
    fn node_id(&self) -> FastStr {
        "node-a".into()
    }

    fn options(&self) -> &BrokerOptions {
        &self.options
    }

    fn tracer(&self) -> Arc<Tracer> {
        self.tracer.clone()
    }

    fn call<'a>(
        &'a self,
        parent: &'a Context,
        action: FastStr,
        params: Arc<Value>,
        opts: CallOptions,
    ) -> BoxFuture<'a, DispatchedCall> {
        Box::pin(async move {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            self.seen_timeouts.lock().unwrap().push(opts.timeout);
            let (child, result) = self.run_child(parent, &action, params, opts);
            *self.last_ctx.lock().unwrap() = Some(child.clone());
            DispatchedCall {
                result,
                ctx: Some(child),
            }
        })
    }

    fn mcall<'a>(
        &'a self,
        parent: &'a Context,
        defs: McallDef,
        opts: CallOptions,
    ) -> BoxFuture<'a, DispatchedBatch> {
        Box::pin(async move {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            self.seen_timeouts.lock().unwrap().push(opts.timeout);
            let mut ctxs = Vec::new();
            let mut results = Vec::new();
            for entry in defs.entries() {
                let (child, result) = self.run_child(
                    parent,
                    &entry.action,
                    Arc::new(entry.params.clone()),
                    opts.clone(),
                );
                results.push(result.unwrap_or(Value::Null));
                ctxs.push(child);
            }
            DispatchedBatch {
                result: Ok(Value::Array(results)),
                ctxs,
            }
        })
    }

    fn emit<'a>(
        &'a self,
        _parent: &'a Context,
        event: FastStr,
        _data: Value,
        opts: CallOptions,
    ) -> BoxFuture<'a, Result<(), StarError>> {
        Box::pin(async move {
            let normalized = matches!(opts.groups, Some(Groups::Many(_)));
            let groups = opts.groups.map(Groups::into_vec).unwrap_or_default();
            self.events.lock().unwrap().push((event, normalized, groups));
            Ok(())
        })
    }

    fn broadcast<'a>(
        &'a self,
        parent: &'a Context,
        event: FastStr,
        data: Value,
        opts: CallOptions,
    ) -> BoxFuture<'a, Result<(), StarError>> {
        self.emit(parent, event, data, opts)
    }
}

fn root_ctx(broker: &Arc<MockBroker>, opts: CallOptions) -> Context {
    let broker: Arc<dyn Broker> = broker.clone();
    Context::create(broker, None, Arc::new(Value::Null), opts, None)
}

#[tokio::test]
async fn depth_guard_rejects_before_dispatch() {
    let broker = MockBroker::new(BrokerOptions::new().with_max_call_level(2));
    let root = root_ctx(&broker, CallOptions::new());

    root.call("b.run", Value::Null, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(broker.dispatches(), 1);

    let child = broker.last_ctx();
    assert_eq!(child.level(), 2);

    let err = child
        .call("c.run", Value::Null, CallOptions::new())
        .await
        .unwrap_err();
    assert_matches!(err, StarError::MaxCallLevel { level: 2, .. });
    assert_eq!(broker.dispatches(), 1, "guard fires before the broker");
    assert!(!err.retryable(), "a deeper retry would hit the same wall");
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_skips_the_dispatch() {
    let broker = MockBroker::new(BrokerOptions::new());
    let mut ctx = root_ctx(
        &broker,
        CallOptions::new().with_timeout(Duration::from_millis(100)),
    );
    ctx.set_start_time(Instant::now());
    tokio::time::advance(Duration::from_millis(100)).await;

    let err = ctx
        .call("posts.get", Value::Null, CallOptions::new())
        .await
        .unwrap_err();
    assert_matches!(
        err,
        StarError::RequestSkipped { ref action, ref node_id }
            if action == "posts.get" && node_id == "node-a"
    );
    assert!(!err.retryable(), "the budget stays exhausted on retry");
    assert_eq!(broker.dispatches(), 0);
}

#[tokio::test(start_paused = true)]
async fn child_timeout_narrows_to_the_remaining_budget() {
    let broker = MockBroker::new(BrokerOptions::new());
    let mut ctx = root_ctx(
        &broker,
        CallOptions::new().with_timeout(Duration::from_secs(1)),
    );
    ctx.set_start_time(Instant::now());
    tokio::time::advance(Duration::from_millis(200)).await;

    ctx.call("a.one", Value::Null, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(broker.last_timeout(), Some(Duration::from_millis(800)));

    ctx.call(
        "a.two",
        Value::Null,
        CallOptions::new().with_timeout(Duration::from_millis(300)),
    )
    .await
    .unwrap();
    assert_eq!(
        broker.last_timeout(),
        Some(Duration::from_millis(300)),
        "a smaller explicit timeout is kept"
    );

    ctx.call(
        "a.three",
        Value::Null,
        CallOptions::new().with_timeout(Duration::from_secs(5)),
    )
    .await
    .unwrap();
    assert_eq!(
        broker.last_timeout(),
        Some(Duration::from_millis(800)),
        "a larger explicit timeout shrinks to the remaining budget"
    );
}

#[tokio::test(start_paused = true)]
async fn budget_shrinks_across_a_three_hop_chain() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("starmesh=debug"))
        .try_init();

    let broker = MockBroker::new(BrokerOptions::new());
    let mut a = root_ctx(
        &broker,
        CallOptions::new().with_timeout(Duration::from_millis(1000)),
    );
    a.set_start_time(Instant::now());

    tokio::time::advance(Duration::from_millis(200)).await;
    a.call("b.run", Value::Null, CallOptions::new()).await?;
    assert_eq!(broker.last_timeout(), Some(Duration::from_millis(800)));

    let b = broker.last_ctx();
    assert_eq!(b.level(), 2);
    tokio::time::advance(Duration::from_millis(100)).await;
    b.call("c.run", Value::Null, CallOptions::new()).await?;
    assert_eq!(broker.last_timeout(), Some(Duration::from_millis(700)));

    let c = broker.last_ctx();
    assert_eq!(c.level(), 3);
    assert_eq!(c.request_id(), a.request_id());
    tokio::time::advance(Duration::from_millis(700)).await;
    let err = c
        .call("d.run", Value::Null, CallOptions::new())
        .await
        .unwrap_err();
    assert_matches!(err, StarError::RequestSkipped { ref action, .. } if action == "d.run");
    assert_eq!(broker.dispatches(), 2);
    Ok(())
}

#[tokio::test]
async fn meta_merges_back_on_success_and_failure() {
    let broker = MockBroker::failing(BrokerOptions::new(), &["bad.op"]);
    let ctx = root_ctx(&broker, CallOptions::new());
    ctx.meta().insert("user".into(), json!("ada"));

    ctx.call("posts.get", Value::Null, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(*ctx.meta().get("handled_by").unwrap(), json!("posts.get"));
    assert_eq!(
        *ctx.meta().get("user").unwrap(),
        json!("ada"),
        "pre-existing keys survive the merge"
    );

    let err = ctx
        .call("bad.op", Value::Null, CallOptions::new())
        .await
        .unwrap_err();
    assert_matches!(err, StarError::ServerError { .. });
    assert_eq!(
        *ctx.meta().get("handled_by").unwrap(),
        json!("bad.op"),
        "the failed child's meta still merged, later key wins"
    );
}

#[tokio::test]
async fn mcall_merges_every_branch_in_definition_order() -> anyhow::Result<()> {
    let broker = MockBroker::new(BrokerOptions::new());
    let ctx = root_ctx(&broker, CallOptions::new());

    let defs = McallDef::List(vec![
        McallEntry::new("a.one", json!({ "n": 1 })),
        McallEntry::new("a.two", json!({ "n": 2 })),
    ]);
    let result = ctx.mcall(defs, CallOptions::new()).await?;
    assert_eq!(result.as_array().unwrap().len(), 2);

    assert_eq!(*ctx.meta().get("seen.a.one").unwrap(), json!(true));
    assert_eq!(*ctx.meta().get("seen.a.two").unwrap(), json!(true));
    assert_eq!(
        *ctx.meta().get("handled_by").unwrap(),
        json!("a.two"),
        "the last definition wins the shared key"
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn skipped_batch_names_every_action() {
    let broker = MockBroker::new(BrokerOptions::new());
    let mut ctx = root_ctx(
        &broker,
        CallOptions::new().with_timeout(Duration::from_millis(50)),
    );
    ctx.set_start_time(Instant::now());
    tokio::time::advance(Duration::from_millis(50)).await;

    let defs = McallDef::Named(vec![
        ("one".into(), McallEntry::new("a.one", Value::Null)),
        ("two".into(), McallEntry::new("a.two", Value::Null)),
    ]);
    let err = ctx.mcall(defs, CallOptions::new()).await.unwrap_err();
    assert_matches!(
        err,
        StarError::RequestSkipped { ref action, .. } if action == "a.one, a.two"
    );
    assert_eq!(broker.dispatches(), 0);
}

#[tokio::test]
async fn emit_normalizes_groups_to_a_list() -> anyhow::Result<()> {
    let broker = MockBroker::new(BrokerOptions::new());
    let ctx = root_ctx(&broker, CallOptions::new());

    ctx.emit(
        "user.created",
        json!({ "id": 1 }),
        CallOptions::new().with_groups("mail"),
    )
    .await?;

    let events = broker.events.lock().unwrap();
    let (event, normalized, groups) = &events[0];
    assert_eq!(event, "user.created");
    assert!(*normalized, "a single group arrives as a one-element list");
    assert_eq!(groups, &vec![FastStr::from("mail")]);
    Ok(())
}

struct RecordingExporter {
    finished: Mutex<Vec<FastStr>>,
}

impl SpanExporter for RecordingExporter {
    fn span_finished(&self, span: &Span) {
        self.finished.lock().unwrap().push(span.name());
    }
}

#[tokio::test]
async fn sampled_spans_reach_the_exporter_in_finish_order() {
    let recorder = Arc::new(RecordingExporter {
        finished: Mutex::new(Vec::new()),
    });
    let tracer = Arc::new(Tracer::new(
        TracerOptions::new().with_exporter(ExporterConfig::Custom(recorder.clone())),
    ));
    tracer.init();
    let broker = MockBroker::with_tracer(BrokerOptions::new(), tracer);

    let mut ctx = root_ctx(&broker, CallOptions::new());
    ctx.set_tracing(true);
    let outer = ctx.start_span("action 'posts.get'", SpanOptions::new());
    let inner = ctx.start_span("db.query", SpanOptions::new());
    ctx.finish_span(&inner, None);
    ctx.finish_span(&outer, None);

    let finished = recorder.finished.lock().unwrap();
    assert_eq!(
        finished.as_slice(),
        [
            FastStr::from("db.query"),
            FastStr::from("action 'posts.get'")
        ]
    );
}

#[tokio::test]
async fn unsampled_contexts_produce_unsampled_spans() {
    let recorder = Arc::new(RecordingExporter {
        finished: Mutex::new(Vec::new()),
    });
    let tracer = Arc::new(Tracer::new(
        TracerOptions::new().with_exporter(ExporterConfig::Custom(recorder.clone())),
    ));
    tracer.init();
    let broker = MockBroker::with_tracer(BrokerOptions::new(), tracer);

    let mut ctx = root_ctx(&broker, CallOptions::new());
    ctx.set_tracing(false);
    let span = ctx.start_span("action 'posts.get'", SpanOptions::new());
    ctx.finish_span(&span, None);

    assert!(recorder.finished.lock().unwrap().is_empty());
}
