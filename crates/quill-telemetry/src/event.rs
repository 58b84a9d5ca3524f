//! Event model and builder
//!
//! A [`LogEvent`] is an ordered field mapping plus, optionally, a raw
//! [`ExceptionInfo`] that the processor chain turns into text before rendering.

use crate::enrichment::CapturedStack;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Field holding the short machine name of the event
pub const EVENT_KEY: &str = "event";
/// Field holding the severity
pub const LEVEL_KEY: &str = "level";
/// Field holding the human readable text
pub const MESSAGE_KEY: &str = "message";
/// Sub-section holding error details
pub const ERROR_KEY: &str = "error";

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    #[serde(alias = "debug")]
    Debug,
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "warning", alias = "WARN", alias = "warn")]
    Warning,
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "critical")]
    Critical,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Debug,
        Level::Info,
        Level::Warning,
        Level::Error,
        Level::Critical,
    ];

    /// Canonical upper-case name, as rendered
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    /// Lower-case method name of the originating call (`logger.warning(...)`)
    pub fn method_name(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Level {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARNING" | "WARN" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            "CRITICAL" => Ok(Level::Critical),
            _ => Err(Error::InvalidLevel {
                level: s.to_string(),
            }),
        }
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warning,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Blame location of an error inside application code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// The `error` sub-section of an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<ErrorLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorInfo {
    /// Merge into an existing `error` section without touching keys already present
    pub fn merge_into(&self, section: &mut Map<String, Value>) {
        if let Some(type_name) = &self.type_name {
            section
                .entry("type")
                .or_insert_with(|| Value::String(type_name.clone()));
        }
        if let Some(message) = &self.message {
            section
                .entry("message")
                .or_insert_with(|| Value::String(message.clone()));
        }
        if let Some(location) = &self.location {
            section.entry("location").or_insert_with(|| {
                serde_json::json!({
                    "file": location.file,
                    "line": location.line,
                    "function": location.function,
                })
            });
        }
        if let Some(stack_trace) = &self.stack_trace {
            section
                .entry("stack_trace")
                .or_insert_with(|| Value::String(stack_trace.clone()));
        }
    }
}

/// Raw exception context attached to a log call
///
/// Never rendered directly; the exception formatting processor consumes it.
#[derive(Debug, Clone, Default)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    /// Messages of the `source()` chain, outermost first
    pub causes: Vec<String>,
    pub stack: Option<CapturedStack>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            causes: Vec::new(),
            stack: None,
        }
    }

    /// Describe a typed error, walking its `source()` chain
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let mut info = Self::new(short_type_name(std::any::type_name::<E>()), err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            info.causes.push(cause.to_string());
            source = cause.source();
        }
        info
    }

    /// Describe an `anyhow::Error`, reusing its backtrace when one was captured
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let mut info = Self::new("Error", err.to_string());
        info.causes = err.chain().skip(1).map(|c| c.to_string()).collect();
        let backtrace = err.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            info.stack = Some(CapturedStack::from_backtrace(backtrace));
        }
        info
    }

    pub fn with_stack(mut self, stack: CapturedStack) -> Self {
        self.stack = Some(stack);
        self
    }
}

pub(crate) fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// A structured event travelling through the processor chain
#[derive(Debug, Clone, Default)]
pub struct LogEvent {
    fields: Map<String, Value>,
    exception: Option<ExceptionInfo>,
    logger_name: Option<String>,
}

impl LogEvent {
    /// Create an event with `event` and the lower-case `level` method name set
    pub fn new(level: Level, name: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(EVENT_KEY.to_string(), Value::String(name.into()));
        fields.insert(
            LEVEL_KEY.to_string(),
            Value::String(level.method_name().to_string()),
        );
        Self {
            fields,
            exception: None,
            logger_name: None,
        }
    }

    /// Wrap an arbitrary field mapping
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            exception: None,
            logger_name: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Overwrite a field
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Set a field only if the caller has not set it; returns whether it was inserted
    pub fn insert_if_absent(&mut self, key: &str, value: Value) -> bool {
        if self.fields.contains_key(key) {
            return false;
        }
        self.fields.insert(key.to_string(), value);
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    /// Mutable access to a nested object section, creating it when absent.
    ///
    /// A non-object value already stored under `key` is kept under `value`
    /// inside the new object rather than discarded.
    pub fn section_mut(&mut self, key: &str) -> &mut Map<String, Value> {
        let slot = self
            .fields
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            let previous = std::mem::replace(slot, Value::Object(Map::new()));
            if let Value::Object(map) = slot {
                let name = if previous.is_string() { "message" } else { "value" };
                map.insert(name.to_string(), previous);
            }
        }
        match slot {
            Value::Object(map) => map,
            _ => unreachable!("section slot was just normalized to an object"),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    pub fn level(&self) -> Option<&str> {
        self.fields.get(LEVEL_KEY).and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get(EVENT_KEY).and_then(Value::as_str)
    }

    pub fn exception(&self) -> Option<&ExceptionInfo> {
        self.exception.as_ref()
    }

    pub fn exception_mut(&mut self) -> Option<&mut ExceptionInfo> {
        self.exception.as_mut()
    }

    pub fn set_exception(&mut self, exception: ExceptionInfo) {
        self.exception = Some(exception);
    }

    pub fn take_exception(&mut self) -> Option<ExceptionInfo> {
        self.exception.take()
    }

    pub fn logger_name(&self) -> Option<&str> {
        self.logger_name.as_deref()
    }

    pub fn set_logger_name(&mut self, name: impl Into<String>) {
        self.logger_name = Some(name.into());
    }
}

/// Builder for a single log call
///
/// Emission through [`EventBuilder::emit`] is fire-and-forget; [`EventBuilder::build`]
/// performs the strict validation used by callers that want to see usage errors.
#[derive(Debug, Clone)]
#[must_use = "an event builder does nothing until emitted"]
pub struct EventBuilder {
    level: String,
    name: String,
    message: Option<String>,
    sections: Map<String, Value>,
    exception: Option<ExceptionInfo>,
    logger_name: Option<String>,
}

impl EventBuilder {
    pub fn new(level: Level, name: impl Into<String>) -> Self {
        Self::with_raw_level(level.as_str(), name)
    }

    /// Builder for a level given as free text (CLI, bridges); validated on build
    pub fn with_raw_level(level: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            name: name.into(),
            message: None,
            sections: Map::new(),
            exception: None,
            logger_name: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach a payload section (or any top-level field)
    pub fn section(mut self, name: impl Into<String>, payload: impl Serialize) -> Self {
        self.sections.insert(name.into(), to_value_lossy(&payload));
        self
    }

    /// Attach several sections at once
    pub fn sections(mut self, sections: Map<String, Value>) -> Self {
        self.sections.extend(sections);
        self
    }

    pub fn http(self, payload: impl Serialize) -> Self {
        self.section("http", payload)
    }

    pub fn query(self, payload: impl Serialize) -> Self {
        self.section("query", payload)
    }

    pub fn error(self, payload: impl Serialize) -> Self {
        self.section(ERROR_KEY, payload)
    }

    pub fn context(self, payload: impl Serialize) -> Self {
        self.section("context", payload)
    }

    /// Attach exception context from a typed error
    pub fn exception<E>(mut self, err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        self.exception = Some(ExceptionInfo::from_error(err));
        self
    }

    /// Attach exception context from an `anyhow::Error`
    pub fn anyhow(mut self, err: &anyhow::Error) -> Self {
        self.exception = Some(ExceptionInfo::from_anyhow(err));
        self
    }

    pub fn exception_info(mut self, info: ExceptionInfo) -> Self {
        self.exception = Some(info);
        self
    }

    pub fn logger_name(mut self, name: impl Into<String>) -> Self {
        self.logger_name = Some(name.into());
        self
    }

    /// Strict build: fails on an unknown level or an empty event name
    pub fn build(self) -> Result<LogEvent> {
        let level: Level = self.level.parse()?;
        if self.name.trim().is_empty() {
            return Err(Error::MissingEventName);
        }
        Ok(self.assemble(level))
    }

    /// Lenient build used by the emit path: unknown levels become INFO and an empty
    /// name becomes `unnamed_event`. The usage errors are returned for reporting.
    pub(crate) fn build_normalized(mut self) -> (LogEvent, Vec<Error>) {
        let mut problems = Vec::new();
        let level = match self.level.parse::<Level>() {
            Ok(level) => level,
            Err(e) => {
                problems.push(e);
                Level::Info
            }
        };
        if self.name.trim().is_empty() {
            problems.push(Error::MissingEventName);
            self.name = "unnamed_event".to_string();
        }
        (self.assemble(level), problems)
    }

    /// Misuse that [`build_normalized`](Self::build_normalized) would correct
    pub(crate) fn problems(&self) -> Vec<Error> {
        let mut problems = Vec::new();
        if let Err(e) = self.level.parse::<Level>() {
            problems.push(e);
        }
        if self.name.trim().is_empty() {
            problems.push(Error::MissingEventName);
        }
        problems
    }

    /// Level this builder will resolve to, without consuming it
    pub(crate) fn resolved_level(&self) -> Level {
        self.level.parse().unwrap_or(Level::Info)
    }

    fn assemble(self, level: Level) -> LogEvent {
        let mut event = LogEvent::new(level, self.name);
        if let Some(message) = self.message {
            event.set(MESSAGE_KEY, Value::String(message));
        }
        for (key, value) in self.sections {
            event.insert_if_absent(&key, value);
        }
        if let Some(exception) = self.exception {
            event.set_exception(exception);
        }
        if let Some(logger_name) = self.logger_name {
            event.set_logger_name(logger_name);
        }
        event
    }
}

/// Serialize a payload, substituting a descriptive string when serialization fails
pub(crate) fn to_value_lossy<T: Serialize + ?Sized>(payload: &T) -> Value {
    serde_json::to_value(payload)
        .unwrap_or_else(|e| Value::String(format!("<unserializable: {}>", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_level_parsing() {
        assert_eq!("info".parse::<Level>().unwrap(), Level::Info);
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!(" Critical ".parse::<Level>().unwrap(), Level::Critical);
        assert!(matches!(
            "verbose".parse::<Level>(),
            Err(Error::InvalidLevel { .. })
        ));
    }

    #[test]
    fn test_builder_sets_fields_in_order() {
        let event = EventBuilder::new(Level::Info, "user_fetched")
            .message("User fetched")
            .context(json!({ "user_id": 7 }))
            .build()
            .unwrap();

        let keys: Vec<_> = event.fields().keys().cloned().collect();
        assert_eq!(keys, vec!["event", "level", "message", "context"]);
        assert_eq!(event.level(), Some("info"));
        assert_eq!(event.get("context"), Some(&json!({ "user_id": 7 })));
    }

    #[test]
    fn test_builder_rejects_invalid_input() {
        let err = EventBuilder::with_raw_level("loud", "x").build().unwrap_err();
        assert!(matches!(err, Error::InvalidLevel { .. }));

        let err = EventBuilder::new(Level::Info, "  ").build().unwrap_err();
        assert!(matches!(err, Error::MissingEventName));
    }

    #[test]
    fn test_normalized_build_reports_problems() {
        let (event, problems) = EventBuilder::with_raw_level("loud", "").build_normalized();
        assert_eq!(problems.len(), 2);
        assert_eq!(event.level(), Some("info"));
        assert_eq!(event.name(), Some("unnamed_event"));
    }

    #[test]
    fn test_unserializable_payload_is_substituted() {
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);

        let event = EventBuilder::new(Level::Info, "odd_payload")
            .context(&bad)
            .build()
            .unwrap();

        let rendered = event.get("context").and_then(Value::as_str).unwrap();
        assert!(rendered.starts_with("<unserializable"));
    }

    #[test]
    fn test_section_mut_preserves_scalar_values() {
        let mut event = LogEvent::new(Level::Error, "failure");
        event.set("error", json!("boom"));

        event
            .section_mut("error")
            .insert("type".to_string(), json!("Io"));

        assert_eq!(
            event.get("error"),
            Some(&json!({ "message": "boom", "type": "Io" }))
        );
    }

    #[test]
    fn test_exception_from_error_walks_sources() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer failure")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let info = ExceptionInfo::from_error(&err);

        assert_eq!(info.type_name, "Outer");
        assert_eq!(info.message, "outer failure");
        assert_eq!(info.causes, vec!["disk gone".to_string()]);
    }

    #[test]
    fn test_error_info_merge_keeps_caller_values() {
        let mut section = Map::new();
        section.insert("type".to_string(), json!("CallerType"));

        ErrorInfo {
            type_name: Some("Derived".to_string()),
            message: Some("msg".to_string()),
            location: Some(ErrorLocation {
                file: "src/main.rs".to_string(),
                line: 3,
                function: "main".to_string(),
            }),
            stack_trace: None,
        }
        .merge_into(&mut section);

        assert_eq!(section["type"], json!("CallerType"));
        assert_eq!(section["message"], json!("msg"));
        assert_eq!(section["location"]["line"], json!(3));
        assert!(!section.contains_key("stack_trace"));
    }
}
