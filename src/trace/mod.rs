// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Distributed tracing: sampling, spans and exporters.
//!
//! The [`Tracer`] owns sampling policy and exporter fan-out; [`Span`] is a
//! cheaply-clonable handle over shared span state, so the same span can live
//! in a context's span stack and inside an exporter at once.

pub mod exporters;
pub mod rate_limiter;
pub mod span;
pub mod tracer;

pub use exporters::{ExporterConfig, SpanExporter, ZipkinExporter, ZipkinOptions};
pub use rate_limiter::RateLimiter;
pub use span::{Span, SpanLogEntry, SpanOptions};
pub use tracer::{SamplingOptions, TagsConfig, Tracer, TracerOptions};
