// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! starmesh is the call-context and distributed-tracing core of a
//! microservice framework.
//!
//! A [`Context`] travels with every action call and event delivery, carrying
//! correlation ids, call depth, the timeout budget, shared `meta` and the
//! span stack. Dispatch itself is injected through the [`Broker`] trait;
//! this crate owns the guards and propagation semantics layered on top, plus
//! the [`Tracer`]/[`Span`] machinery that turns call chains into exportable
//! traces.
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod broker;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod trace;

pub use crate::broker::{
    generate_uid, Broker, BrokerOptions, CallOptions, DispatchedBatch, DispatchedCall, Groups,
    McallDef, McallEntry,
};
pub use crate::context::{Context, EventType};
pub use crate::endpoint::{ActionSchema, Endpoint, EndpointTarget, EventSchema, ServiceInfo};
pub use crate::error::StarError;
pub use crate::trace::{
    ExporterConfig, RateLimiter, SamplingOptions, Span, SpanExporter, SpanLogEntry, SpanOptions,
    TagsConfig, Tracer, TracerOptions, ZipkinExporter, ZipkinOptions,
};
