// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Sampling policy, span factory and exporter fan-out.
//!
//! A [`Tracer`] is a per-broker instance passed by reference into every
//! context and span, never ambient global state. It decides which spans are
//! sampled, stamps default tags, and fans finished spans out to the
//! configured exporters.

use crate::trace::exporters::{ExporterConfig, SpanExporter};
use crate::trace::rate_limiter::RateLimiter;
use crate::trace::span::{Span, SpanOptions};
use faststr::FastStr;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::info;

/// Sampling configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SamplingOptions {
    /// Fractional sampling rate in `[0.0, 1.0]`. `1.0` keeps every span.
    pub rate: f64,
    /// When set (> 0), a token budget of sampled traces per second replaces
    /// the fractional rate.
    pub traces_per_second: Option<f64>,
    /// Spans below this priority are never sampled.
    pub min_priority: Option<u8>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            rate: 1.0,
            traces_per_second: None,
            min_priority: None,
        }
    }
}

impl SamplingOptions {
    /// Creates the default sampling options.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the fractional sampling rate.
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Sets the traces-per-second budget.
    pub fn with_traces_per_second(mut self, traces_per_second: f64) -> Self {
        self.traces_per_second = Some(traces_per_second);
        self
    }

    /// Sets the minimum sampled priority.
    pub fn with_min_priority(mut self, min_priority: u8) -> Self {
        self.min_priority = Some(min_priority);
        self
    }
}

/// Default tags stamped on every span: a static map, or a function of the
/// tracer resolved once at [`Tracer::init`].
#[derive(Debug, Clone)]
pub enum TagsConfig {
    /// A fixed tag map.
    Static(Map<String, Value>),
    /// Computed from the tracer at init time.
    Fn(fn(&Tracer) -> Map<String, Value>),
}

/// Tracer configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TracerOptions {
    /// Master switch; a disabled tracer still builds spans but brokers are
    /// expected not to open them for actions/events.
    pub enabled: bool,
    /// Sampling policy.
    pub sampling: SamplingOptions,
    /// Whether action calls get spans.
    pub actions: bool,
    /// Whether events get spans.
    pub events: bool,
    /// Default tags for every span.
    pub default_tags: Option<TagsConfig>,
    /// Exporter configurations, resolved once at init.
    pub exporter: Vec<ExporterConfig>,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling: Default::default(),
            actions: true,
            events: false,
            default_tags: None,
            exporter: Vec::new(),
        }
    }
}

impl TracerOptions {
    /// Creates the default tracer options.
    pub fn new() -> Self {
        Default::default()
    }

    /// Enables or disables tracing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the sampling policy.
    pub fn with_sampling(mut self, sampling: SamplingOptions) -> Self {
        self.sampling = sampling;
        self
    }

    /// Sets whether action calls get spans.
    pub fn with_actions(mut self, actions: bool) -> Self {
        self.actions = actions;
        self
    }

    /// Sets whether events get spans.
    pub fn with_events(mut self, events: bool) -> Self {
        self.events = events;
        self
    }

    /// Sets the default tags.
    pub fn with_default_tags(mut self, default_tags: TagsConfig) -> Self {
        self.default_tags = Some(default_tags);
        self
    }

    /// Adds an exporter configuration.
    pub fn with_exporter(mut self, exporter: ExporterConfig) -> Self {
        self.exporter.push(exporter);
        self
    }
}

/// Per-broker sampling policy, span factory and exporter fan-out.
pub struct Tracer {
    options: TracerOptions,
    sample_counter: Mutex<u64>,
    rate_limiter: Option<RateLimiter>,
    default_tags: OnceLock<Map<String, Value>>,
    exporters: OnceLock<Vec<Arc<dyn SpanExporter>>>,
}

impl Tracer {
    /// Creates a tracer. Call [`Tracer::init`] once it is wrapped in an
    /// `Arc` to resolve default tags and construct the exporters.
    pub fn new(options: TracerOptions) -> Self {
        let rate_limiter = options
            .sampling
            .traces_per_second
            .filter(|tps| *tps > 0.0)
            .map(RateLimiter::new);
        if options.enabled {
            info!("[STARMESH] tracing: enabled");
        }
        Self {
            options,
            sample_counter: Mutex::new(0),
            rate_limiter,
            default_tags: OnceLock::new(),
            exporters: OnceLock::new(),
        }
    }

    /// The tracer configuration.
    pub fn options(&self) -> &TracerOptions {
        &self.options
    }

    /// Whether tracing is enabled.
    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    /// Resolves default tags and constructs the exporters, each initialized
    /// with a back-reference to this tracer. Idempotent.
    pub fn init(self: &Arc<Self>) {
        let resolved = match &self.options.default_tags {
            Some(TagsConfig::Static(tags)) => tags.clone(),
            Some(TagsConfig::Fn(f)) => f(self),
            None => Map::new(),
        };
        let _ = self.default_tags.set(resolved);

        if !self.options.exporter.is_empty() && self.exporters.get().is_none() {
            let exporters: Vec<Arc<dyn SpanExporter>> = self
                .options
                .exporter
                .iter()
                .map(|config| config.resolve())
                .collect();
            for exporter in &exporters {
                exporter.init(self);
            }
            let names: Vec<&str> = self.options.exporter.iter().map(|c| c.name()).collect();
            info!("[STARMESH] tracing exporters: {}", names.join(", "));
            let _ = self.exporters.set(exporters);
        }
    }

    /// Awaits the teardown of every exporter.
    pub async fn stop(&self) {
        if let Some(exporters) = self.exporters.get() {
            join_all(exporters.iter().map(|exporter| exporter.stop())).await;
        }
    }

    /// Decides whether a span of the given priority is sampled.
    ///
    /// Priority gate first, then the rate limiter when configured, otherwise
    /// the deterministic fractional sampler: rate 0 never, rate 1 always,
    /// fractional rates flip true with even spacing (every `1/rate`-th call)
    /// rather than at random.
    pub fn should_sample(&self, priority: u8) -> bool {
        if let Some(min) = self.options.sampling.min_priority {
            if priority < min {
                return false;
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            return limiter.check();
        }

        let rate = self.options.sampling.rate;
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }

        let mut counter = self
            .sample_counter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *counter += 1;
        if (*counter as f64) * rate >= 1.0 {
            *counter = 0;
            true
        } else {
            false
        }
    }

    /// Creates and starts a span. An explicit parent span in `opts`
    /// contributes trace id, parent id, sampling and service; explicit
    /// fields still win. Never returns an unstarted span.
    pub fn start_span(self: &Arc<Self>, name: impl Into<FastStr>, opts: SpanOptions) -> Span {
        let mut opts = opts;
        if let Some(parent) = opts.parent_span.take() {
            if opts.trace_id.is_none() {
                opts.trace_id = Some(parent.trace_id());
            }
            if opts.parent_id.is_none() {
                opts.parent_id = Some(parent.id());
            }
            if opts.sampled.is_none() {
                opts.sampled = Some(parent.sampled());
            }
            if opts.service.is_none() {
                opts.service = parent.service().cloned();
            }
        }
        let span = Span::new(self.clone(), name.into(), opts, self.default_tags.get());
        span.start(None);
        span
    }

    /// Fans a started sampled span out to the exporters. Fire-and-forget.
    pub fn span_started(&self, span: &Span) {
        if !span.sampled() {
            return;
        }
        if let Some(exporters) = self.exporters.get() {
            for exporter in exporters {
                exporter.span_started(span);
            }
        }
    }

    /// Fans a finished sampled span out to the exporters. Fire-and-forget.
    pub fn span_finished(&self, span: &Span) {
        if !span.sampled() {
            return;
        }
        if let Some(exporters) = self.exporters.get() {
            for exporter in exporters {
                exporter.span_finished(span);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer_with_rate(rate: f64) -> Tracer {
        Tracer::new(TracerOptions::new().with_sampling(SamplingOptions::new().with_rate(rate)))
    }

    #[test]
    fn rate_zero_never_samples() {
        let tracer = tracer_with_rate(0.0);
        assert!((0..1000).all(|_| !tracer.should_sample(5)));
    }

    #[test]
    fn rate_one_always_samples() {
        let tracer = tracer_with_rate(1.0);
        assert!((0..1000).all(|_| tracer.should_sample(5)));
    }

    #[test]
    fn fractional_rate_is_evenly_spaced() {
        let tracer = tracer_with_rate(0.25);
        let decisions: Vec<bool> = (0..1000).map(|_| tracer.should_sample(5)).collect();
        for (i, sampled) in decisions.iter().enumerate() {
            // every 4th call flips true, the rest stay false
            assert_eq!(*sampled, i % 4 == 3, "call {i}");
        }
    }

    #[test]
    fn low_priority_is_never_sampled() {
        let tracer = Tracer::new(
            TracerOptions::new()
                .with_sampling(SamplingOptions::new().with_rate(1.0).with_min_priority(5)),
        );
        assert!(!tracer.should_sample(4));
        assert!(tracer.should_sample(5));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_overrides_the_fractional_rate() {
        let tracer = Tracer::new(TracerOptions::new().with_sampling(
            SamplingOptions::new().with_rate(0.0).with_traces_per_second(2.0),
        ));
        let granted = (0..10).filter(|_| tracer.should_sample(5)).count();
        assert_eq!(granted, 2);
    }

    #[test]
    fn default_tags_are_stamped_and_overridable() {
        let mut defaults = Map::new();
        defaults.insert("env".into(), Value::String("test".into()));
        defaults.insert("region".into(), Value::String("eu".into()));

        let tracer = Arc::new(
            Tracer::new(TracerOptions::new().with_default_tags(TagsConfig::Static(defaults))),
        );
        tracer.init();

        let mut explicit = Map::new();
        explicit.insert("region".into(), Value::String("us".into()));
        let span = tracer.start_span("tagged.op", SpanOptions::new().with_tags(explicit));

        let tags = span.tags();
        assert_eq!(tags["env"], "test");
        assert_eq!(tags["region"], "us", "explicit tags win over defaults");
    }
}
