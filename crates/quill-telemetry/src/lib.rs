//! # Quill Telemetry
//!
//! Structured event pipeline that turns ad-hoc log calls into uniformly shaped,
//! newline-delimited JSON records.
//!
//! ## Features
//!
//! - **Correlation Context**: per unit-of-work `trace_id`/`span_id`/`request_id` binding
//!   that never leaks across concurrently running requests or tasks
//! - **Processor Chain**: fixed, ordered enrichment of every event (context, level,
//!   timestamp, service identity, trace context, error location, exception text)
//! - **Error Enrichment**: blame-frame inference from captured backtraces, skipping
//!   dependency and standard-library frames
//! - **Rotating Storage**: daily rotation to `<base>-<YYYY-MM-DD>.log` with count-based
//!   retention and a one-time fallback directory
//! - **Best Effort**: the emit path never returns an error and never panics into the caller
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quill_telemetry::{context, Level, TelemetryConfig, TelemetrySystem};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TelemetryConfig::default();
//!     let _guard = TelemetrySystem::init(config)?;
//!
//!     context::bind([("request_id", "r-1")]);
//!     quill_telemetry::event(Level::Info, "user_fetched")
//!         .context(json!({ "user_id": 7 }))
//!         .emit();
//!     context::clear();
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod context;
pub mod enrichment;
pub mod event;
pub mod filters;
pub mod processors;
pub mod renderer;
pub mod request;
pub mod retention;
pub mod rotation;
pub mod sink;
pub mod system;

#[cfg(test)]
mod tests;

pub use config::{TelemetryConfig, TimeZoneSetting};
pub use context::{CorrelationContext, CorrelationId};
pub use event::{ErrorInfo, EventBuilder, ExceptionInfo, Level, LogEvent};
pub use request::{instrument_request, instrument_task, HttpRequestInfo};
pub use system::{event, log, Logger, PipelineHealth, TelemetryGuard, TelemetrySystem};

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Telemetry-specific errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Log rotation error: {message}")]
    Rotation { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Telemetry system error: {message}")]
    System { message: String },

    #[error("Invalid log level: {level}")]
    InvalidLevel { level: String },

    #[error("Event name must not be empty")]
    MissingEventName,
}
