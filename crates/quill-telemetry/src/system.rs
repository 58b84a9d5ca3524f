//! Logger assembly and the process-wide emit API

use crate::{
    bridge::{self, PipelineLayer},
    config::TelemetryConfig,
    enrichment::CapturedStack,
    event::{EventBuilder, Level},
    filters::SelfTargetFilter,
    processors::{
        resolve_host, Processor, ProcessorChain, ProcessorContext, StandardProcessors,
        TraceContextSource,
    },
    renderer::JsonRenderer,
    rotation::{Clock, RotatingFileSink, RotationSettings, RotationState, SystemClock},
    sink::{ConsoleSink, Sink},
    Error, Result,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logger installed by [`TelemetrySystem::init`]
static GLOBAL_LOGGER: RwLock<Option<Logger>> = RwLock::new(None);

const MISUSE_EVENT: &str = "logging_misuse";

#[derive(Debug, Default)]
struct Counters {
    emitted: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
    write_failures: AtomicU64,
}

/// Counters and rotation state exposed to collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineHealth {
    pub events_emitted: u64,
    pub events_filtered: u64,
    pub events_failed: u64,
    pub write_failures: u64,
    pub sinks: Vec<&'static str>,
    pub rotation: Option<RotationState>,
}

struct LoggerInner {
    name: String,
    enabled: bool,
    min_level: Level,
    capture_stack: bool,
    slow_request_threshold: Duration,
    chain: ProcessorChain,
    renderer: JsonRenderer,
    sinks: Vec<Arc<dyn Sink>>,
    counters: Counters,
    misuse_reported: AtomicBool,
}

/// A configured pipeline: processor chain, renderer and sinks.
///
/// Cloning is cheap and every clone feeds the same sinks. Emitting never returns
/// an error and never panics into the caller.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    pub fn builder(config: TelemetryConfig) -> LoggerBuilder {
        LoggerBuilder::new(config)
    }

    /// Logger with the console and rotating file sinks the configuration asks for
    pub fn from_config(config: TelemetryConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn min_level(&self) -> Level {
        self.inner.min_level
    }

    /// Requests slower than this are reported as `slow_request_detected`
    pub fn slow_request_threshold(&self) -> Duration {
        self.inner.slow_request_threshold
    }

    /// Start an event bound to this logger's name; finish with [`EventBuilder::emit_to`]
    pub fn event(&self, level: Level, name: impl Into<String>) -> EventBuilder {
        EventBuilder::new(level, name).logger_name(self.inner.name.clone())
    }

    /// Fire-and-forget emit. Unknown levels are treated as INFO and an empty name
    /// as `unnamed_event`; the first such misuse is reported once as a
    /// `logging_misuse` warning.
    pub fn log(
        &self,
        level: impl AsRef<str>,
        name: &str,
        message: Option<&str>,
        sections: Map<String, Value>,
    ) {
        let mut builder = EventBuilder::with_raw_level(level.as_ref(), name).sections(sections);
        if let Some(message) = message {
            builder = builder.message(message);
        }
        self.emit(builder);
    }

    /// Run a built event through the pipeline
    pub fn emit(&self, builder: EventBuilder) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.emit_inner(builder)));
        if outcome.is_err() {
            self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            eprintln!("quill: event emission panicked; event discarded");
        }
    }

    fn emit_inner(&self, builder: EventBuilder) {
        let inner = &self.inner;
        let level = builder.resolved_level();

        if !inner.enabled || level < inner.min_level {
            inner.counters.filtered.fetch_add(1, Ordering::Relaxed);
            if inner.enabled {
                let problems = builder.problems();
                if !problems.is_empty() {
                    self.report_misuse(&problems);
                }
            }
            return;
        }

        let (mut event, problems) = builder.build_normalized();

        if inner.capture_stack {
            if let Some(exception) = event.exception_mut() {
                if exception.stack.is_none() {
                    exception.stack = Some(CapturedStack::capture());
                }
            }
        }

        let logger_name = event
            .logger_name()
            .map(str::to_string)
            .unwrap_or_else(|| inner.name.clone());
        let ctx = ProcessorContext::new(&logger_name, level);

        match inner.chain.run(&ctx, event) {
            Some(event) => {
                let line = inner.renderer.render(&event);
                self.write(&line);
                inner.counters.emitted.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                inner.counters.filtered.fetch_add(1, Ordering::Relaxed);
            }
        }

        if !problems.is_empty() {
            self.report_misuse(&problems);
        }
    }

    fn write(&self, line: &str) {
        for sink in &self.inner.sinks {
            if let Err(e) = sink.write_line(line) {
                self.inner
                    .counters
                    .write_failures
                    .fetch_add(1, Ordering::Relaxed);
                eprintln!("quill: sink '{}' write failed: {}", sink.name(), e);
            }
        }
    }

    fn report_misuse(&self, problems: &[Error]) {
        if self.inner.misuse_reported.swap(true, Ordering::SeqCst) {
            return;
        }

        let problems: Vec<String> = problems.iter().map(|p| p.to_string()).collect();
        let meta = EventBuilder::new(Level::Warning, MISUSE_EVENT)
            .message("Invalid log call was normalized; later occurrences are not reported")
            .context(json!({ "problems": problems }))
            .logger_name(self.inner.name.clone());
        self.emit_inner(meta);
    }

    pub fn flush(&self) {
        for sink in &self.inner.sinks {
            if let Err(e) = sink.flush() {
                eprintln!("quill: sink '{}' flush failed: {}", sink.name(), e);
            }
        }
    }

    pub fn health(&self) -> PipelineHealth {
        let counters = &self.inner.counters;
        PipelineHealth {
            events_emitted: counters.emitted.load(Ordering::Relaxed),
            events_filtered: counters.filtered.load(Ordering::Relaxed),
            events_failed: counters.failed.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
            sinks: self.inner.sinks.iter().map(|s| s.name()).collect(),
            rotation: self.inner.sinks.iter().find_map(|s| s.rotation_state()),
        }
    }

    fn same_as(&self, other: &Logger) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Assembles a [`Logger`]
pub struct LoggerBuilder {
    config: TelemetryConfig,
    name: String,
    clock: Arc<dyn Clock>,
    host: Option<String>,
    trace_source: Option<Arc<dyn TraceContextSource>>,
    processors: Vec<Box<dyn Processor>>,
    sinks: Vec<Arc<dyn Sink>>,
    default_sinks: bool,
}

impl LoggerBuilder {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            name: config.service.name.clone(),
            config,
            clock: Arc::new(SystemClock),
            host: None,
            trace_source: None,
            processors: Vec::new(),
            sinks: Vec::new(),
            default_sinks: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the host name instead of asking the OS
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn trace_source(mut self, source: Arc<dyn TraceContextSource>) -> Self {
        self.trace_source = Some(source);
        self
    }

    /// Append a processor after the standard chain
    pub fn processor(mut self, processor: impl Processor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    pub fn sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn shared_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Skip the console and file sinks derived from the configuration
    pub fn without_default_sinks(mut self) -> Self {
        self.default_sinks = false;
        self
    }

    pub fn build(self) -> Result<Logger> {
        let config = self.config;
        config.validate()?;

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        if self.default_sinks && config.enabled {
            if config.logging.console_enabled {
                sinks.push(Arc::new(ConsoleSink));
            }
            if config.logging.file_enabled {
                let settings = RotationSettings::from_config(&config, Arc::clone(&self.clock))?;
                match RotatingFileSink::open(settings) {
                    Ok(sink) => sinks.push(Arc::new(sink)),
                    Err(e) => eprintln!("quill: file logging disabled: {}", e),
                }
            }
        }
        sinks.extend(self.sinks);

        let mut chain = ProcessorChain::standard(StandardProcessors {
            service: config.service.name.clone(),
            environment: config.service.environment.clone(),
            host: self.host.unwrap_or_else(resolve_host),
            time_zone: config.time_zone()?,
            clock: self.clock,
            enrichment: config.enrichment.clone(),
            trace_source: self.trace_source,
        });
        for processor in self.processors {
            chain.push(processor);
        }

        Ok(Logger {
            inner: Arc::new(LoggerInner {
                name: self.name,
                enabled: config.enabled,
                min_level: config.logging.min_level,
                capture_stack: config.enrichment.capture_stack,
                slow_request_threshold: Duration::from_millis(
                    config.requests.slow_request_threshold_ms,
                ),
                chain,
                renderer: JsonRenderer::new(),
                sinks,
                counters: Counters::default(),
                misuse_reported: AtomicBool::new(false),
            }),
        })
    }
}

/// Process-wide pipeline installation
pub struct TelemetrySystem;

impl TelemetrySystem {
    /// Build the logger from `config` and install it for the global emit API
    pub fn init(config: TelemetryConfig) -> Result<TelemetryGuard> {
        let install_bridge = config.logging.install_tracing_bridge;
        Self::init_with(Logger::builder(config), install_bridge)
    }

    /// Install a customised logger, optionally routing `tracing` events into it
    pub fn init_with(builder: LoggerBuilder, install_bridge: bool) -> Result<TelemetryGuard> {
        if Self::logger().is_some() {
            return Err(already_initialized());
        }
        let logger = builder.build()?;

        {
            let mut global = GLOBAL_LOGGER
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if global.is_some() {
                return Err(already_initialized());
            }
            *global = Some(logger.clone());
        }

        if install_bridge {
            if let Err(e) = Self::install_tracing_bridge(&logger) {
                Self::uninstall(&logger);
                return Err(e);
            }
        }

        tracing::info!(
            telemetry.event = "system_initialized",
            telemetry.version = env!("CARGO_PKG_VERSION"),
            logger = logger.name(),
            bridge = install_bridge,
            "Telemetry system initialized successfully"
        );

        Ok(TelemetryGuard { logger })
    }

    /// Route `tracing` events into the pipeline. `RUST_LOG` overrides the level.
    fn install_tracing_bridge(logger: &Logger) -> Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(bridge::directive_for(logger.min_level())));

        tracing_subscriber::registry()
            .with(filter)
            .with(PipelineLayer::new(logger.clone()).with_filter(SelfTargetFilter::new()))
            .try_init()
            .map_err(|e| Error::System {
                message: format!("Failed to initialize tracing subscriber: {}", e),
            })
    }

    /// The installed logger, if any
    pub fn logger() -> Option<Logger> {
        GLOBAL_LOGGER
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn health() -> Option<PipelineHealth> {
        Self::logger().map(|logger| logger.health())
    }

    pub fn flush() {
        if let Some(logger) = Self::logger() {
            logger.flush();
        }
    }

    fn uninstall(logger: &Logger) {
        let mut global = GLOBAL_LOGGER
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if global.as_ref().is_some_and(|installed| installed.same_as(logger)) {
            *global = None;
        }
    }
}

fn already_initialized() -> Error {
    Error::System {
        message: "Telemetry system is already initialized".to_string(),
    }
}

/// Keeps the global logger installed; flushes and uninstalls it on drop
#[must_use = "the global logger is uninstalled when the guard is dropped"]
pub struct TelemetryGuard {
    logger: Logger,
}

impl TelemetryGuard {
    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        self.logger.flush();
        TelemetrySystem::uninstall(&self.logger);
        tracing::info!(
            telemetry.event = "system_shutdown",
            "Telemetry system shutting down"
        );
    }
}

/// Emit through the global logger. Discarded when nothing is installed.
pub fn log(level: impl AsRef<str>, name: &str, message: Option<&str>, sections: Map<String, Value>) {
    if let Some(logger) = TelemetrySystem::logger() {
        logger.log(level, name, message, sections);
    }
}

/// Start an event for the global logger; finish with [`EventBuilder::emit`]
pub fn event(level: Level, name: impl Into<String>) -> EventBuilder {
    EventBuilder::new(level, name)
}

impl EventBuilder {
    /// Emit through the global logger
    pub fn emit(self) {
        if let Some(logger) = TelemetrySystem::logger() {
            logger.emit(self);
        }
    }

    pub fn emit_to(self, logger: &Logger) {
        logger.emit(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ExceptionInfo;
    use crate::processors::Disposition;
    use crate::rotation::ManualClock;
    use crate::sink::MemorySink;
    use crate::LogEvent;
    use chrono::{TimeZone, Utc};
    use serial_test::serial;

    fn memory_logger(config: TelemetryConfig) -> (Logger, MemorySink) {
        let sink = MemorySink::new();
        let logger = Logger::builder(config)
            .without_default_sinks()
            .sink(sink.clone())
            .host("test-host")
            .clock(Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            )))
            .build()
            .unwrap();
        (logger, sink)
    }

    fn parsed(sink: &MemorySink) -> Vec<Value> {
        sink.lines()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_log_renders_one_line() {
        let (logger, sink) = memory_logger(TelemetryConfig::default());
        let mut sections = Map::new();
        sections.insert("http".to_string(), json!({ "method": "GET", "status": 200 }));

        logger.log("INFO", "request_done", Some("done"), sections);

        let lines = parsed(&sink);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], json!("request_done"));
        assert_eq!(lines[0]["level"], json!("INFO"));
        assert_eq!(lines[0]["message"], json!("done"));
        assert_eq!(lines[0]["http"]["status"], json!(200));
        assert_eq!(lines[0]["host"], json!("test-host"));
        assert_eq!(lines[0]["timestamp"], json!("2024-01-02T03:04:05.000000+00:00"));
    }

    #[test]
    fn test_events_below_min_level_are_filtered() {
        let mut config = TelemetryConfig::default();
        config.logging.min_level = Level::Warning;
        let (logger, sink) = memory_logger(config);

        logger.event(Level::Info, "chatty").emit_to(&logger);
        logger.event(Level::Error, "important").emit_to(&logger);

        let lines = parsed(&sink);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], json!("important"));

        let health = logger.health();
        assert_eq!(health.events_emitted, 1);
        assert_eq!(health.events_filtered, 1);
        assert!(health.rotation.is_none());
    }

    #[test]
    fn test_disabled_logger_writes_nothing() {
        let mut config = TelemetryConfig::default();
        config.enabled = false;
        let (logger, sink) = memory_logger(config);

        logger.log(Level::Critical, "ignored", None, Map::new());
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_misuse_is_normalized_and_reported_once() {
        let (logger, sink) = memory_logger(TelemetryConfig::default());

        logger.log("LOUD", "odd_level", None, Map::new());
        logger.log("INFO", "", None, Map::new());

        let lines = parsed(&sink);
        let names: Vec<_> = lines.iter().map(|l| l["event"].as_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["odd_level", MISUSE_EVENT, "unnamed_event"]);
        assert_eq!(lines[0]["level"], json!("INFO"));
        assert_eq!(lines[1]["level"], json!("WARNING"));
        assert!(lines[1]["context"]["problems"][0]
            .as_str()
            .unwrap()
            .contains("LOUD"));
    }

    #[test]
    fn test_misuse_is_reported_even_when_event_is_filtered() {
        let mut config = TelemetryConfig::default();
        config.logging.min_level = Level::Warning;
        let (logger, sink) = memory_logger(config);

        logger.log("verbose", "odd_level", None, Map::new());

        let lines = parsed(&sink);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], json!(MISUSE_EVENT));
        assert_eq!(lines[0]["level"], json!("WARNING"));
        assert_eq!(logger.health().events_filtered, 1);
    }

    #[test]
    fn test_exception_gets_stack_when_capture_enabled() {
        let (logger, sink) = memory_logger(TelemetryConfig::default());

        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.toml");
        logger
            .event(Level::Error, "config_read_failed")
            .exception(&err)
            .emit_to(&logger);

        let lines = parsed(&sink);
        assert_eq!(lines[0]["error"]["type"], json!("Error"));
        assert_eq!(lines[0]["error"]["message"], json!("missing.toml"));
        assert!(lines[0]["error"]["stack_trace"].is_string());
    }

    #[test]
    fn test_exception_without_capture_has_no_trace() {
        let mut config = TelemetryConfig::default();
        config.enrichment.capture_stack = false;
        let (logger, sink) = memory_logger(config);

        logger
            .event(Level::Error, "failed")
            .exception_info(ExceptionInfo::new("Timeout", "upstream took too long"))
            .emit_to(&logger);

        let lines = parsed(&sink);
        assert_eq!(lines[0]["error"]["type"], json!("Timeout"));
        assert!(lines[0]["error"].get("stack_trace").is_none());
        assert!(lines[0]["error"].get("location").is_none());
    }

    #[test]
    fn test_failing_sink_does_not_reach_caller() {
        struct Broken;
        impl Sink for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn write_line(&self, _line: &str) -> std::io::Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
            }
        }

        let memory = MemorySink::new();
        let logger = Logger::builder(TelemetryConfig::default())
            .without_default_sinks()
            .sink(Broken)
            .sink(memory.clone())
            .build()
            .unwrap();

        logger.log(Level::Info, "still_written", None, Map::new());

        assert_eq!(memory.lines().len(), 1);
        assert_eq!(logger.health().write_failures, 1);
    }

    #[test]
    fn test_custom_processor_runs_after_standard_chain() {
        struct Redact;
        impl Processor for Redact {
            fn name(&self) -> &'static str {
                "redact_host"
            }
            fn process(&self, _ctx: &ProcessorContext<'_>, event: &mut LogEvent) -> Disposition {
                event.set("host", json!("redacted"));
                Disposition::Keep
            }
        }

        let memory = MemorySink::new();
        let logger = Logger::builder(TelemetryConfig::default())
            .without_default_sinks()
            .sink(memory.clone())
            .processor(Redact)
            .build()
            .unwrap();

        logger.log(Level::Info, "redacted", None, Map::new());
        let lines = parsed(&memory);
        assert_eq!(lines[0]["host"], json!("redacted"));
    }

    #[test]
    #[serial]
    fn test_global_api_before_and_after_init() {
        // Nothing installed: silently discarded
        log(Level::Info, "too_early", None, Map::new());

        let memory = MemorySink::new();
        let builder = Logger::builder(TelemetryConfig::default())
            .without_default_sinks()
            .sink(memory.clone());
        let guard = TelemetrySystem::init_with(builder, false).unwrap();

        event(Level::Info, "via_builder").emit();
        log("WARNING", "via_log", Some("hello"), Map::new());
        assert!(TelemetrySystem::init(TelemetryConfig::default()).is_err());

        let names: Vec<_> = parsed(&memory)
            .iter()
            .map(|l| l["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["via_builder", "via_log"]);
        assert_eq!(TelemetrySystem::health().unwrap().events_emitted, 2);

        drop(guard);
        assert!(TelemetrySystem::logger().is_none());
        event(Level::Info, "too_late").emit();
        assert_eq!(memory.lines().len(), 2);
    }
}
