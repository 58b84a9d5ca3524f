//! Unit-of-work wrappers for HTTP requests and background tasks
//!
//! Each wrapper runs the caller's future inside a fresh correlation scope, logs the
//! start and the outcome with the elapsed time, and leaves no bindings behind on
//! any exit path (success, error or cancellation).

use crate::context::{self, CorrelationContext, CorrelationId, SPAN_ID, TRACE_ID};
use crate::event::{short_type_name, Level};
use crate::system::Logger;
use serde::Serialize;
use serde_json::json;
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

pub const TASK_ID: &str = "task_id";

/// The parts of an incoming request worth logging
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpRequestInfo {
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Incoming `X-Trace-Id` header, reused as the trace id when present
    #[serde(skip)]
    pub trace_header: Option<String>,
}

impl HttpRequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_trace_header(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_header = Some(trace_id.into());
        self
    }
}

/// Anything that carries an HTTP status code
pub trait ResponseStatus {
    fn status_code(&self) -> u16;
}

impl ResponseStatus for u16 {
    fn status_code(&self) -> u16 {
        *self
    }
}

/// Milliseconds rounded to two decimals
fn millis(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 100_000.0).round() / 100.0
}

/// Run `handler` as one HTTP request unit of work.
///
/// Logs `http_request_started`, then `http_request_completed` or
/// `http_request_failed`, and `slow_request_detected` when the request took longer
/// than the logger's threshold. The handler's result is returned unchanged.
pub async fn instrument_request<F, T, E>(
    logger: &Logger,
    request: HttpRequestInfo,
    handler: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    T: ResponseStatus,
    E: Display,
{
    let correlation = CorrelationContext::for_request(request.trace_header.as_deref());

    context::scope(correlation, async move {
        let started = Instant::now();

        logger
            .event(Level::Info, "http_request_started")
            .message("HTTP request started")
            .http(&request)
            .emit_to(logger);

        let outcome = handler.await;
        let elapsed = started.elapsed();
        let duration_ms = millis(elapsed);

        match &outcome {
            Ok(response) => logger
                .event(Level::Info, "http_request_completed")
                .message("HTTP request completed")
                .http(json!({
                    "method": request.method,
                    "path": request.path,
                    "status_code": response.status_code(),
                    "duration_ms": duration_ms,
                    "client_ip": request.client_ip,
                    "user_agent": request.user_agent,
                }))
                .emit_to(logger),
            Err(e) => logger
                .event(Level::Error, "http_request_failed")
                .message(format!("HTTP request failed: {}", e))
                .http(json!({
                    "method": request.method,
                    "path": request.path,
                    "duration_ms": duration_ms,
                    "client_ip": request.client_ip,
                }))
                .error(json!({
                    "type": short_type_name(std::any::type_name::<E>()),
                    "message": e.to_string(),
                }))
                .emit_to(logger),
        }

        let threshold = logger.slow_request_threshold();
        if elapsed > threshold {
            logger
                .event(Level::Warning, "slow_request_detected")
                .message("Slow request detected")
                .context(json!({
                    "path": request.path,
                    "method": request.method,
                    "process_time_ms": duration_ms,
                    "threshold_ms": threshold.as_millis() as u64,
                }))
                .emit_to(logger);
        }

        outcome
    })
    .await
}

/// Run `task` as one background-task unit of work.
///
/// The task keeps the caller's trace id when one is bound and gets its own span
/// and task ids.
pub async fn instrument_task<F, T, E>(logger: &Logger, task_name: &str, task: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let parent = context::current();
    let trace_id = parent
        .get(TRACE_ID)
        .map(str::to_string)
        .unwrap_or_else(|| CorrelationId::new().into());
    let correlation = CorrelationContext::new()
        .with(TRACE_ID, trace_id)
        .with(SPAN_ID, CorrelationId::new())
        .with(TASK_ID, CorrelationId::new());

    context::scope(correlation, async move {
        let started = Instant::now();

        logger
            .event(Level::Info, "task_started")
            .message(format!("Task {} started", task_name))
            .context(json!({ "task_name": task_name }))
            .emit_to(logger);

        let outcome = task.await;
        let duration_ms = millis(started.elapsed());

        match &outcome {
            Ok(_) => logger
                .event(Level::Info, "task_completed")
                .message(format!("Task {} completed", task_name))
                .context(json!({ "task_name": task_name, "duration_ms": duration_ms }))
                .emit_to(logger),
            Err(e) => logger
                .event(Level::Error, "task_failed")
                .message(format!("Task {} failed: {}", task_name, e))
                .context(json!({ "task_name": task_name, "duration_ms": duration_ms }))
                .error(json!({
                    "type": short_type_name(std::any::type_name::<E>()),
                    "message": e.to_string(),
                }))
                .emit_to(logger),
        }

        outcome
    })
    .await
}
