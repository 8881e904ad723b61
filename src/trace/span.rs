// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! One timed, tagged segment of a distributed trace.
//!
//! A span moves Created → Started → Finished. It carries two clocks: the
//! wall-clock `start_time` exporters report, and a monotonic tick captured at
//! start so duration math is immune to wall-clock adjustments. The sampling
//! decision is made once at construction and never changes.

use crate::broker::generate_uid;
use crate::endpoint::ServiceInfo;
use crate::error::StarError;
use crate::trace::Tracer;
use faststr::FastStr;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// Options for creating a span.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct SpanOptions {
    /// Explicit span id; generated when absent.
    pub id: Option<FastStr>,
    /// Trace the span belongs to; defaults to the span's own id (new trace).
    pub trace_id: Option<FastStr>,
    /// Id of the parent span or context.
    pub parent_id: Option<FastStr>,
    /// Span type tag; defaults to `custom`.
    pub span_type: Option<FastStr>,
    /// Service the span is attributed to.
    pub service: Option<ServiceInfo>,
    /// Sampling priority; defaults to 5.
    pub priority: Option<u8>,
    /// Explicit sampling decision, bypassing the tracer policy.
    pub sampled: Option<bool>,
    /// Initial tags, merged over the tracer's default tags.
    pub tags: Option<Map<String, Value>>,
    /// Parent span contributing trace id, parent id and sampling.
    pub parent_span: Option<Span>,
}

impl SpanOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the trace id.
    pub fn with_trace_id(mut self, trace_id: impl Into<FastStr>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Sets the parent id.
    pub fn with_parent_id(mut self, parent_id: impl Into<FastStr>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the span type.
    pub fn with_span_type(mut self, span_type: impl Into<FastStr>) -> Self {
        self.span_type = Some(span_type.into());
        self
    }

    /// Sets the attributed service.
    pub fn with_service(mut self, service: ServiceInfo) -> Self {
        self.service = Some(service);
        self
    }

    /// Sets the sampling priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Forces the sampling decision.
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = Some(sampled);
        self
    }

    /// Sets the initial tags.
    pub fn with_tags(mut self, tags: Map<String, Value>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Sets the parent span.
    pub fn with_parent_span(mut self, parent: Span) -> Self {
        self.parent_span = Some(parent);
        self
    }
}

/// One log event recorded inside a span.
#[derive(Debug, Clone)]
pub struct SpanLogEntry {
    /// Event name.
    pub name: FastStr,
    /// Structured fields.
    pub fields: Map<String, Value>,
    /// Wall-clock time of the event.
    pub time: SystemTime,
    /// Elapsed time since span start.
    pub elapsed: Duration,
}

struct SpanShared {
    id: FastStr,
    trace_id: FastStr,
    parent_id: Option<FastStr>,
    name: FastStr,
    span_type: FastStr,
    service: Option<ServiceInfo>,
    priority: u8,
    sampled: bool,
    state: Mutex<SpanState>,
}

#[derive(Default)]
struct SpanState {
    start_time: Option<SystemTime>,
    start_ticks: Option<Instant>,
    finish_time: Option<SystemTime>,
    duration: Option<Duration>,
    error: Option<StarError>,
    tags: Map<String, Value>,
    logs: Vec<SpanLogEntry>,
}

/// Cloneable handle to one trace segment.
#[derive(Clone)]
pub struct Span {
    tracer: Arc<Tracer>,
    shared: Arc<SpanShared>,
}

impl Span {
    pub(crate) fn new(
        tracer: Arc<Tracer>,
        name: FastStr,
        opts: SpanOptions,
        default_tags: Option<&Map<String, Value>>,
    ) -> Self {
        let id = opts.id.unwrap_or_else(generate_uid);
        let trace_id = opts.trace_id.unwrap_or_else(|| id.clone());
        let priority = opts.priority.unwrap_or(5);
        let sampled = opts
            .sampled
            .unwrap_or_else(|| tracer.should_sample(priority));

        let mut tags = Map::new();
        if let Some(defaults) = default_tags {
            tags.extend(defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(explicit) = opts.tags {
            tags.extend(explicit);
        }

        Self {
            tracer,
            shared: Arc::new(SpanShared {
                id,
                trace_id,
                parent_id: opts.parent_id,
                name,
                span_type: opts.span_type.unwrap_or_else(|| "custom".into()),
                service: opts.service,
                priority,
                sampled,
                state: Mutex::new(SpanState {
                    tags,
                    ..Default::default()
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpanState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether two handles point at the same span.
    pub fn same_span(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Span id.
    pub fn id(&self) -> FastStr {
        self.shared.id.clone()
    }

    /// Root id of the whole trace.
    pub fn trace_id(&self) -> FastStr {
        self.shared.trace_id.clone()
    }

    /// Parent span/context id, if any.
    pub fn parent_id(&self) -> Option<FastStr> {
        self.shared.parent_id.clone()
    }

    /// Span name.
    pub fn name(&self) -> FastStr {
        self.shared.name.clone()
    }

    /// Span type tag.
    pub fn span_type(&self) -> FastStr {
        self.shared.span_type.clone()
    }

    /// Service the span is attributed to.
    pub fn service(&self) -> Option<&ServiceInfo> {
        self.shared.service.as_ref()
    }

    /// Sampling priority.
    pub fn priority(&self) -> u8 {
        self.shared.priority
    }

    /// Sampling decision, fixed at creation.
    pub fn sampled(&self) -> bool {
        self.shared.sampled
    }

    /// Wall-clock start time, set when the span starts.
    pub fn start_time(&self) -> Option<SystemTime> {
        self.lock().start_time
    }

    /// Wall-clock finish time, set exactly once.
    pub fn finish_time(&self) -> Option<SystemTime> {
        self.lock().finish_time
    }

    /// Duration, computed exactly once at finish.
    pub fn duration(&self) -> Option<Duration> {
        self.lock().duration
    }

    /// Captured failure, if any.
    pub fn error(&self) -> Option<StarError> {
        self.lock().error.clone()
    }

    /// Snapshot of the tags.
    pub fn tags(&self) -> Map<String, Value> {
        self.lock().tags.clone()
    }

    /// Snapshot of the recorded log events.
    pub fn logs(&self) -> Vec<SpanLogEntry> {
        self.lock().logs.clone()
    }

    /// A span is active from start until finish.
    pub fn is_active(&self) -> bool {
        self.lock().finish_time.is_none()
    }

    /// Wall-clock "now" derived from the monotonic clock:
    /// `start_time + (monotonic_now - start_ticks)`.
    pub fn current_time(&self) -> SystemTime {
        let state = self.lock();
        match (state.start_time, state.start_ticks) {
            (Some(start), Some(ticks)) => start + ticks.elapsed(),
            _ => SystemTime::now(),
        }
    }

    pub(crate) fn start(&self, time: Option<SystemTime>) {
        {
            let mut state = self.lock();
            if state.start_time.is_some() {
                return;
            }
            state.start_time = Some(time.unwrap_or_else(SystemTime::now));
            state.start_ticks = Some(Instant::now());
        }
        debug!(
            "[STARMESH] span '{}' started ({})",
            self.shared.name, self.shared.id
        );
        self.tracer.span_started(self);
    }

    /// Merges tags into the span. Ignored once the span is finished.
    pub fn add_tags(&self, tags: Map<String, Value>) -> &Self {
        let mut state = self.lock();
        if state.finish_time.is_none() {
            state.tags.extend(tags);
        }
        self
    }

    /// Records a log event. Ignored once the span is finished.
    pub fn log(
        &self,
        name: impl Into<FastStr>,
        fields: Option<Map<String, Value>>,
        time: Option<SystemTime>,
    ) -> &Self {
        let name = name.into();
        let mut state = self.lock();
        if state.finish_time.is_some() {
            return self;
        }
        let now = match (state.start_time, state.start_ticks) {
            (Some(start), Some(ticks)) => start + ticks.elapsed(),
            _ => SystemTime::now(),
        };
        let time = time.unwrap_or(now);
        let elapsed = state
            .start_time
            .and_then(|start| time.duration_since(start).ok())
            .unwrap_or_default();
        state.logs.push(SpanLogEntry {
            name,
            fields: fields.unwrap_or_default(),
            time,
            elapsed,
        });
        self
    }

    /// Captures a failure on the span. Ignored once the span is finished.
    pub fn set_error(&self, error: StarError) -> &Self {
        let mut state = self.lock();
        if state.finish_time.is_none() {
            state.error = Some(error);
        }
        self
    }

    /// Finishes the span, computing the duration exactly once and reporting
    /// it to the tracer. Returns `false` if the span was already finished.
    pub fn finish(&self, time: Option<SystemTime>) -> bool {
        let duration = {
            let mut state = self.lock();
            if state.finish_time.is_some() {
                return false;
            }
            let start = match state.start_time {
                Some(start) => start,
                None => {
                    // finishing an unstarted span collapses it to a point
                    let now = SystemTime::now();
                    state.start_time = Some(now);
                    now
                }
            };
            let finish = match time {
                Some(explicit) => explicit,
                None => match state.start_ticks {
                    Some(ticks) => start + ticks.elapsed(),
                    None => start,
                },
            };
            let duration = finish.duration_since(start).unwrap_or_default();
            state.finish_time = Some(finish);
            state.duration = Some(duration);
            duration
        };
        debug!(
            "[STARMESH] span '{}' finished ({}). Duration: {:.3} ms",
            self.shared.name,
            self.shared.id,
            duration.as_secs_f64() * 1e3
        );
        self.tracer.span_finished(self);
        true
    }

    /// Starts a child span through the tracer, propagating the trace id and
    /// inheriting the sampling decision and service.
    pub fn start_span(&self, name: impl Into<FastStr>, opts: SpanOptions) -> Span {
        let mut opts = opts;
        if opts.trace_id.is_none() {
            opts.trace_id = Some(self.trace_id());
        }
        if opts.parent_id.is_none() {
            opts.parent_id = Some(self.id());
        }
        if opts.sampled.is_none() {
            opts.sampled = Some(self.sampled());
        }
        if opts.service.is_none() {
            opts.service = self.service().cloned();
        }
        opts.parent_span = None;
        self.tracer.start_span(name, opts)
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Span")
            .field("id", &self.shared.id)
            .field("trace_id", &self.shared.trace_id)
            .field("parent_id", &self.shared.parent_id)
            .field("name", &self.shared.name)
            .field("type", &self.shared.span_type)
            .field("sampled", &self.shared.sampled)
            .field("active", &state.finish_time.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TracerOptions;
    use std::thread;

    fn tracer() -> Arc<Tracer> {
        Arc::new(Tracer::new(TracerOptions::new()))
    }

    #[test]
    fn lifecycle_created_started_finished() {
        let tracer = tracer();
        let span = tracer.start_span("unit.op", SpanOptions::new());
        assert!(span.is_active(), "tracer returns started spans");
        assert!(span.start_time().is_some());

        assert!(span.finish(None));
        assert!(!span.is_active());
        assert!(span.duration().is_some());
        assert!(!span.finish(None), "double finish is rejected");
    }

    #[test]
    fn duration_tracks_the_monotonic_clock() {
        let tracer = tracer();
        let span = tracer.start_span("timed.op", SpanOptions::new());
        let ticks = Instant::now();
        thread::sleep(Duration::from_millis(25));
        span.finish(None);
        let elapsed = ticks.elapsed();

        let duration = span.duration().unwrap();
        let delta = if duration > elapsed {
            duration - elapsed
        } else {
            elapsed - duration
        };
        assert!(delta < Duration::from_millis(1), "delta was {delta:?}");
    }

    #[test]
    fn mutation_is_rejected_after_finish() {
        let tracer = tracer();
        let span = tracer.start_span("sealed.op", SpanOptions::new());
        span.finish(None);

        let mut tags = Map::new();
        tags.insert("late".into(), Value::Bool(true));
        span.add_tags(tags);
        span.log("late-event", None, None);
        span.set_error(StarError::InvalidPacketData);

        assert!(span.tags().get("late").is_none());
        assert!(span.logs().is_empty());
        assert!(span.error().is_none());
    }

    #[test]
    fn child_span_inherits_trace_and_sampling() {
        let tracer = tracer();
        let parent = tracer.start_span(
            "parent.op",
            SpanOptions::new().with_service(crate::endpoint::ServiceInfo::new("posts")),
        );
        let child = parent.start_span("child.op", SpanOptions::new());

        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.parent_id(), Some(parent.id()));
        assert_eq!(child.sampled(), parent.sampled());
        assert_eq!(child.service().unwrap().name, "posts");
        assert_ne!(child.id(), parent.id());
    }

    #[test]
    fn log_entries_record_elapsed_time() {
        let tracer = tracer();
        let span = tracer.start_span("logged.op", SpanOptions::new());
        thread::sleep(Duration::from_millis(5));
        span.log("checkpoint", None, None);

        let logs = span.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].name, "checkpoint");
        assert!(logs[0].elapsed >= Duration::from_millis(4));
    }
}
