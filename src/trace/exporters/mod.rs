// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Trace exporters.
//!
//! Exporters must never block the caller: the tracer's fan-out is
//! fire-and-forget, so an exporter queues internally and flushes on its own
//! schedule. Flush failures are logged, never propagated into
//! request-handling paths.

use crate::trace::span::Span;
use crate::trace::Tracer;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

pub mod zipkin;

pub use zipkin::{ZipkinExporter, ZipkinOptions};

/// Backend-specific span sink.
pub trait SpanExporter: Send + Sync + 'static {
    /// Called once with a back-reference to the owning tracer.
    fn init(&self, tracer: &Arc<Tracer>) {
        let _ = tracer;
    }

    /// Awaitable teardown: flush what is queued and stop background work.
    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    /// A sampled span started. Must not block.
    fn span_started(&self, span: &Span) {
        let _ = span;
    }

    /// A sampled span finished. Must not block.
    fn span_finished(&self, span: &Span);
}

/// Exporter configuration, resolved once at [`Tracer::init`].
#[derive(Clone)]
pub enum ExporterConfig {
    /// Zipkin v2 HTTP exporter.
    Zipkin(ZipkinOptions),
    /// A pre-built exporter instance.
    Custom(Arc<dyn SpanExporter>),
}

impl ExporterConfig {
    pub(crate) fn resolve(&self) -> Arc<dyn SpanExporter> {
        match self {
            ExporterConfig::Zipkin(options) => Arc::new(ZipkinExporter::new(options.clone())),
            ExporterConfig::Custom(exporter) => exporter.clone(),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            ExporterConfig::Zipkin(_) => "zipkin",
            ExporterConfig::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for ExporterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExporterConfig::Zipkin(options) => f.debug_tuple("Zipkin").field(options).finish(),
            ExporterConfig::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Flattens nested tag objects into dotted keys, e.g. `{a: {b: 1}}` becomes
/// `{"a.b": 1}`. With `stringify`, leaf values are rendered as strings the
/// way wire formats like Zipkin expect.
pub(crate) fn flatten_tags(
    tags: &Map<String, Value>,
    stringify: bool,
    prefix: &str,
) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in tags {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(nested) => out.extend(flatten_tags(nested, stringify, &key)),
            Value::String(s) if stringify => {
                out.insert(key, Value::String(s.clone()));
            }
            other if stringify => {
                out.insert(key, Value::String(other.to_string()));
            }
            other => {
                out.insert(key, other.clone());
            }
        }
    }
    out
}
