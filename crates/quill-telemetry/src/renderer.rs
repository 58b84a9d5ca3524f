//! Single-line JSON rendering

use crate::event::LogEvent;
use serde_json::{json, Map, Value};

/// Serializes the final field mapping as one newline-free JSON document
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

impl JsonRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Render an event. Never fails: a serialization error produces a minimal
    /// `render_failed` record that still carries the event name.
    pub fn render(&self, event: &LogEvent) -> String {
        self.render_fields(event.fields())
    }

    pub fn render_fields(&self, fields: &Map<String, Value>) -> String {
        match serde_json::to_string(fields) {
            Ok(line) => line,
            Err(e) => {
                let fallback = json!({
                    "event": fields.get("event").cloned().unwrap_or(Value::Null),
                    "level": "ERROR",
                    "message": "event could not be rendered",
                    "error": { "type": "RenderError", "message": e.to_string() },
                });
                fallback.to_string()
            }
        }
    }
}
