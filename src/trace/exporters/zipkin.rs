// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Zipkin v2 trace exporter.
//!
//! Finished sampled spans are snapshotted into an internal queue; a
//! background task POSTs the queued batch as JSON to
//! `{base_url}/api/v2/spans` on a fixed interval. Trace and span ids are
//! sent as hex with dashes stripped, truncated to 16 characters; timestamps
//! and durations are microseconds.

use crate::trace::exporters::{flatten_tags, SpanExporter};
use crate::trace::span::Span;
use crate::trace::Tracer;
use faststr::FastStr;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Zipkin exporter configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ZipkinOptions {
    /// Zipkin collector base URL.
    pub base_url: FastStr,
    /// Flush interval; zero disables the background flusher.
    pub interval: Duration,
    /// Sets the `debug` flag on every reported span.
    pub debug: bool,
    /// Sets the `shared` flag on every reported span.
    pub shared: bool,
    /// Tags stamped on every reported span.
    pub default_tags: Option<Map<String, Value>>,
}

impl Default for ZipkinOptions {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9411".into(),
            interval: Duration::from_secs(5),
            debug: false,
            shared: false,
            default_tags: None,
        }
    }
}

impl ZipkinOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the collector base URL.
    pub fn with_base_url(mut self, base_url: impl Into<FastStr>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the flush interval; zero disables the background flusher.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the `debug` payload flag.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the `shared` payload flag.
    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Sets tags stamped on every reported span.
    pub fn with_default_tags(mut self, default_tags: Map<String, Value>) -> Self {
        self.default_tags = Some(default_tags);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ZipkinEndpoint {
    service_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ZipkinAnnotationEndpoint {
    service_name: Option<String>,
    ipv4: String,
    port: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ZipkinAnnotation {
    value: String,
    endpoint: ZipkinAnnotationEndpoint,
    timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ZipkinSpan {
    name: String,
    kind: &'static str,
    trace_id: String,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    local_endpoint: ZipkinEndpoint,
    remote_endpoint: ZipkinEndpoint,
    annotations: Vec<ZipkinAnnotation>,
    timestamp: u64,
    duration: u64,
    tags: Map<String, Value>,
    debug: bool,
    shared: bool,
}

/// Queue-and-flush exporter for a Zipkin v2 collector.
pub struct ZipkinExporter {
    options: ZipkinOptions,
    client: reqwest::Client,
    queue: Arc<Mutex<Vec<ZipkinSpan>>>,
    shutdown: Arc<Notify>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    default_tags: Map<String, Value>,
}

impl ZipkinExporter {
    /// Creates an exporter. The background flusher starts at
    /// [`SpanExporter::init`], which must run inside a tokio runtime.
    pub fn new(options: ZipkinOptions) -> Self {
        let default_tags = options
            .default_tags
            .as_ref()
            .map(|tags| flatten_tags(tags, true, ""))
            .unwrap_or_default();
        Self {
            options,
            client: reqwest::Client::new(),
            queue: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(Notify::new()),
            flusher: Mutex::new(None),
            default_tags,
        }
    }

    fn collector_url(&self) -> String {
        format!(
            "{}/api/v2/spans",
            self.options.base_url.trim_end_matches('/')
        )
    }

    fn make_payload(&self, span: &Span) -> ZipkinSpan {
        let service_name = span.service().map(|svc| svc.full_name.to_string());

        let mut tags = Map::new();
        tags.insert(
            "service".into(),
            service_name
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        tags.insert("span.type".into(), Value::String(span.span_type().into()));
        tags.extend(self.default_tags.clone());
        tags.extend(flatten_tags(&span.tags(), true, ""));

        let mut annotations = Vec::new();
        if let Some(error) = span.error() {
            tags.insert("error".into(), Value::String(error.to_string()));
            let mut error_fields = Map::new();
            error_fields.insert("message".into(), Value::String(error.to_string()));
            error_fields.insert("code".into(), Value::from(error.code()));
            error_fields.insert("type".into(), Value::String(error.error_type().into()));
            if !error.data().is_null() {
                error_fields.insert("data".into(), error.data());
            }
            tags.extend(flatten_tags(&error_fields, true, "error"));

            annotations.push(ZipkinAnnotation {
                value: "error".into(),
                endpoint: ZipkinAnnotationEndpoint {
                    service_name: service_name.clone(),
                    ipv4: String::new(),
                    port: 0,
                },
                timestamp: span
                    .finish_time()
                    .map(convert_time)
                    .unwrap_or_default(),
            });
        }

        ZipkinSpan {
            name: span.name().to_string(),
            kind: "SERVER",
            trace_id: convert_id(&span.trace_id()),
            id: convert_id(&span.id()),
            parent_id: span.parent_id().map(|id| convert_id(&id)),
            local_endpoint: ZipkinEndpoint {
                service_name: service_name.clone(),
            },
            remote_endpoint: ZipkinEndpoint { service_name },
            annotations,
            timestamp: span.start_time().map(convert_time).unwrap_or_default(),
            duration: span.duration().unwrap_or_default().as_micros() as u64,
            tags,
            debug: self.options.debug,
            shared: self.options.shared,
        }
    }
}

impl SpanExporter for ZipkinExporter {
    fn init(&self, _tracer: &Arc<Tracer>) {
        if self.options.interval.is_zero() {
            return;
        }
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        let client = self.client.clone();
        let url = self.collector_url();
        let interval = self.options.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.notified() => return,
                    _ = ticker.tick() => flush(&client, &url, &queue).await,
                }
            }
        });
        *self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shutdown.notify_one();
            let handle = self
                .flusher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    warn!("[STARMESH] zipkin flusher task failed: {err:?}");
                }
            }
            // drain whatever arrived after the last tick
            flush(&self.client, &self.collector_url(), &self.queue).await;
        })
    }

    fn span_finished(&self, span: &Span) {
        let payload = self.make_payload(span);
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload);
    }
}

async fn flush(client: &reqwest::Client, url: &str, queue: &Mutex<Vec<ZipkinSpan>>) {
    let batch: Vec<ZipkinSpan> = {
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *queue)
    };
    if batch.is_empty() {
        return;
    }
    match client.post(url).json(&batch).send().await {
        Ok(res) if res.status().is_success() => {
            debug!(
                "[STARMESH] {} tracing spans uploaded to zipkin",
                batch.len()
            );
        }
        Ok(res) => {
            warn!(
                "[STARMESH] unable to upload tracing spans to zipkin. Status: {}",
                res.status()
            );
        }
        Err(err) => {
            warn!("[STARMESH] unable to upload tracing spans to zipkin: {err}");
        }
    }
}

fn convert_id(id: &str) -> String {
    id.chars().filter(|c| *c != '-').take(16).collect()
}

fn convert_time(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
