//! Ordered event processors applied before rendering
//!
//! The standard chain runs, in this order: context merge, level normalization,
//! timestamp, common fields, trace context, error enrichment and exception
//! formatting. Processors never overwrite a top-level key the caller already set,
//! except the level normalizer which rewrites `level` in place.

use crate::config::{EnrichmentConfig, TimeZoneSetting};
use crate::context::{self, SPAN_ID, TRACE_ID};
use crate::enrichment::ErrorEnricher;
use crate::event::{Level, LogEvent, ERROR_KEY, LEVEL_KEY};
use crate::rotation::Clock;
use chrono::SecondsFormat;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub const TIMESTAMP_KEY: &str = "timestamp";

/// Metadata about the originating call
#[derive(Debug, Clone, Copy)]
pub struct ProcessorContext<'a> {
    /// Name of the logger that emitted the event
    pub logger_name: &'a str,
    /// Method of the originating call (`info`, `error`, ...)
    pub method_name: &'a str,
}

impl<'a> ProcessorContext<'a> {
    pub fn new(logger_name: &'a str, level: Level) -> Self {
        Self {
            logger_name,
            method_name: level.method_name(),
        }
    }
}

/// What happens to the event after a processor ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Drop,
}

/// A single transformation step
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, ctx: &ProcessorContext<'_>, event: &mut LogEvent) -> Disposition;
}

/// Source of externally managed trace context (e.g. an OpenTelemetry span)
pub trait TraceContextSource: Send + Sync {
    /// `(trace_id, span_id)` of the active span, if any
    fn current_trace(&self) -> Option<(String, Option<String>)>;
}

/// Everything the standard processors need, resolved once at startup
#[derive(Clone)]
pub struct StandardProcessors {
    pub service: String,
    pub environment: String,
    pub host: String,
    pub time_zone: TimeZoneSetting,
    pub clock: Arc<dyn Clock>,
    pub enrichment: EnrichmentConfig,
    pub trace_source: Option<Arc<dyn TraceContextSource>>,
}

/// Ordered, fixed sequence of processors
#[derive(Default)]
pub struct ProcessorChain {
    processors: Vec<Box<dyn Processor>>,
}

impl ProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The seven standard processors in their required order
    pub fn standard(settings: StandardProcessors) -> Self {
        Self::new()
            .with(ContextMergeProcessor)
            .with(LevelProcessor)
            .with(TimestampProcessor::new(settings.time_zone, settings.clock))
            .with(CommonFieldsProcessor::new(
                settings.service,
                settings.environment,
                settings.host,
            ))
            .with(TraceContextProcessor::new(settings.trace_source))
            .with(ErrorEnrichmentProcessor::new(ErrorEnricher::new(
                &settings.enrichment,
            )))
            .with(ExceptionFormattingProcessor::new(ErrorEnricher::new(
                &settings.enrichment,
            )))
    }

    pub fn with(mut self, processor: impl Processor + 'static) -> Self {
        self.push(Box::new(processor));
        self
    }

    /// Append a processor after the existing ones
    pub fn push(&mut self, processor: Box<dyn Processor>) {
        self.processors.push(processor);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Run every processor; `None` when one of them dropped the event.
    ///
    /// A processor that panics is skipped and the event continues with whatever
    /// fields it already has.
    pub fn run(&self, ctx: &ProcessorContext<'_>, mut event: LogEvent) -> Option<LogEvent> {
        for processor in &self.processors {
            let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(ctx, &mut event)));
            match outcome {
                Ok(Disposition::Keep) => {}
                Ok(Disposition::Drop) => return None,
                Err(_) => {
                    eprintln!(
                        "quill: processor '{}' panicked; continuing without it",
                        processor.name()
                    );
                }
            }
        }
        Some(event)
    }
}

/// Copies the unit of work's correlation keys into the event
pub struct ContextMergeProcessor;

impl Processor for ContextMergeProcessor {
    fn name(&self) -> &'static str {
        "merge_context"
    }

    fn process(&self, _ctx: &ProcessorContext<'_>, event: &mut LogEvent) -> Disposition {
        for (key, value) in context::current().iter() {
            event.insert_if_absent(key, Value::String(value.to_string()));
        }
        Disposition::Keep
    }
}

/// Ensures `level` is present and upper-case
pub struct LevelProcessor;

impl Processor for LevelProcessor {
    fn name(&self) -> &'static str {
        "add_log_level"
    }

    fn process(&self, ctx: &ProcessorContext<'_>, event: &mut LogEvent) -> Disposition {
        let level = event
            .level()
            .unwrap_or(ctx.method_name)
            .to_uppercase();
        event.set(LEVEL_KEY, Value::String(level));
        Disposition::Keep
    }
}

/// Stamps the current instant in the reference time zone
pub struct TimestampProcessor {
    time_zone: TimeZoneSetting,
    clock: Arc<dyn Clock>,
}

impl TimestampProcessor {
    pub fn new(time_zone: TimeZoneSetting, clock: Arc<dyn Clock>) -> Self {
        Self { time_zone, clock }
    }
}

impl Processor for TimestampProcessor {
    fn name(&self) -> &'static str {
        "timestamper"
    }

    fn process(&self, _ctx: &ProcessorContext<'_>, event: &mut LogEvent) -> Disposition {
        if !event.contains(TIMESTAMP_KEY) {
            let now = self
                .clock
                .now()
                .with_timezone(&self.time_zone.offset())
                .to_rfc3339_opts(SecondsFormat::Micros, false);
            event.set(TIMESTAMP_KEY, Value::String(now));
        }
        Disposition::Keep
    }
}

/// Adds `service`, `environment` and `host`
pub struct CommonFieldsProcessor {
    service: String,
    environment: String,
    host: String,
}

impl CommonFieldsProcessor {
    pub fn new(service: String, environment: String, host: String) -> Self {
        Self {
            service,
            environment,
            host,
        }
    }
}

impl Processor for CommonFieldsProcessor {
    fn name(&self) -> &'static str {
        "add_common_fields"
    }

    fn process(&self, _ctx: &ProcessorContext<'_>, event: &mut LogEvent) -> Disposition {
        event.insert_if_absent("service", Value::String(self.service.clone()));
        event.insert_if_absent("environment", Value::String(self.environment.clone()));
        event.insert_if_absent("host", Value::String(self.host.clone()));
        Disposition::Keep
    }
}

/// Copies `trace_id`/`span_id` from an external tracer or the context store.
///
/// An external tracer replaces ids that only came from the context store; ids
/// the caller set explicitly are kept.
pub struct TraceContextProcessor {
    source: Option<Arc<dyn TraceContextSource>>,
}

impl TraceContextProcessor {
    pub fn new(source: Option<Arc<dyn TraceContextSource>>) -> Self {
        Self { source }
    }
}

impl Processor for TraceContextProcessor {
    fn name(&self) -> &'static str {
        "add_trace_context"
    }

    fn process(&self, _ctx: &ProcessorContext<'_>, event: &mut LogEvent) -> Disposition {
        let bound = context::current();

        if let Some((trace_id, span_id)) = self.source.as_ref().and_then(|s| s.current_trace()) {
            let external = [(TRACE_ID, Some(trace_id)), (SPAN_ID, span_id)];
            for (key, value) in external {
                let Some(value) = value else { continue };
                let merged_from_store = match (event.get(key), bound.get(key)) {
                    (None, _) => true,
                    (Some(Value::String(current)), Some(stored)) => current == stored,
                    _ => false,
                };
                if merged_from_store {
                    event.set(key, Value::String(value));
                }
            }
        }

        for key in [TRACE_ID, SPAN_ID] {
            if let Some(value) = bound.get(key) {
                event.insert_if_absent(key, Value::String(value.to_string()));
            }
        }
        Disposition::Keep
    }
}

/// Attaches `error.location` and `error.stack_trace` for events carrying an exception
pub struct ErrorEnrichmentProcessor {
    enricher: ErrorEnricher,
}

impl ErrorEnrichmentProcessor {
    pub fn new(enricher: ErrorEnricher) -> Self {
        Self { enricher }
    }
}

impl Processor for ErrorEnrichmentProcessor {
    fn name(&self) -> &'static str {
        "add_error_location"
    }

    fn process(&self, _ctx: &ProcessorContext<'_>, event: &mut LogEvent) -> Disposition {
        let Some(exception) = event.exception() else {
            return Disposition::Keep;
        };

        let enricher = &self.enricher;
        match catch_unwind(AssertUnwindSafe(|| enricher.enrich(exception))) {
            Ok(info) => info.merge_into(event.section_mut(ERROR_KEY)),
            Err(_) => eprintln!("quill: error enrichment failed; emitting event without it"),
        }
        Disposition::Keep
    }
}

/// Turns any remaining raw exception into text and discards the raw object
pub struct ExceptionFormattingProcessor {
    enricher: ErrorEnricher,
}

impl ExceptionFormattingProcessor {
    pub fn new(enricher: ErrorEnricher) -> Self {
        Self { enricher }
    }
}

impl Processor for ExceptionFormattingProcessor {
    fn name(&self) -> &'static str {
        "format_exc_info"
    }

    fn process(&self, _ctx: &ProcessorContext<'_>, event: &mut LogEvent) -> Disposition {
        let Some(exception) = event.take_exception() else {
            return Disposition::Keep;
        };

        let section = event.section_mut(ERROR_KEY);
        section
            .entry("type")
            .or_insert_with(|| Value::String(exception.type_name.clone()));
        section
            .entry("message")
            .or_insert_with(|| Value::String(exception.message.clone()));
        if !exception.causes.is_empty() {
            section.entry("causes").or_insert_with(|| {
                Value::Array(exception.causes.iter().cloned().map(Value::String).collect())
            });
        }

        if !section.contains_key("stack_trace") {
            if let Some(trace) = self.enricher.enrich(&exception).stack_trace {
                section.insert("stack_trace".to_string(), Value::String(trace));
            }
        }
        Disposition::Keep
    }
}

/// Best-effort host name, resolved once
pub fn resolve_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
