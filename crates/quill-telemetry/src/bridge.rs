//! `tracing` integration
//!
//! [`PipelineLayer`] turns `tracing` events into pipeline events: an `event` (or
//! `telemetry.event`) field becomes the event name, `message` the message, a field
//! recorded as an error becomes exception context, and every other field lands in
//! the `context` section.

use crate::event::{EventBuilder, ExceptionInfo, Level};
use crate::filters::SelfTargetFilter;
use crate::system::Logger;
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Event name used when a `tracing` event carries none
pub const DEFAULT_EVENT_NAME: &str = "tracing_event";

/// `EnvFilter` directive matching a pipeline level
pub fn directive_for(level: Level) -> &'static str {
    match level {
        Level::Debug => "debug",
        Level::Info => "info",
        Level::Warning => "warn",
        Level::Error | Level::Critical => "error",
    }
}

/// Layer forwarding `tracing` events into a [`Logger`]
pub struct PipelineLayer {
    logger: Logger,
}

impl PipelineLayer {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for PipelineLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !SelfTargetFilter::allows(metadata.target()) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let name = visitor
            .event_name
            .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string());
        let mut builder =
            EventBuilder::new(Level::from(*metadata.level()), name).logger_name(metadata.target());

        if let Some(message) = visitor.message {
            builder = builder.message(message);
        }
        if !visitor.fields.is_empty() {
            builder = builder.context(Value::Object(visitor.fields));
        }
        if let Some(exception) = visitor.exception {
            builder = builder.exception_info(exception);
        }

        self.logger.emit(builder);
    }
}

/// Visitor for extracting fields into JSON
#[derive(Default)]
struct FieldVisitor {
    fields: Map<String, Value>,
    message: Option<String>,
    event_name: Option<String>,
    exception: Option<ExceptionInfo>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        match field.name() {
            "event" | "telemetry.event" => {
                self.event_name = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            "message" => {
                self.message = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            name => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, json!(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, json!(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        let mut exception = ExceptionInfo::new(field.name(), value.to_string());
        let mut source = value.source();
        while let Some(cause) = source {
            exception.causes.push(cause.to_string());
            source = cause.source();
        }
        self.exception = Some(exception);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, json!(format!("{:?}", value)));
    }
}
