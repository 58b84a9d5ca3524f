//! Error enrichment: blame-frame inference over captured call stacks
//!
//! The search itself is a pure function over an ordered slice of [`StackFrame`]s.
//! [`CapturedStack`] adapts the standard library's `Backtrace` text output into
//! that form so the search never depends on a particular unwinding API.

use crate::config::EnrichmentConfig;
use crate::event::{ErrorInfo, ErrorLocation, ExceptionInfo};
use std::backtrace::Backtrace;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Path fragments identifying dependency and standard-library sources
pub const DEFAULT_FOREIGN_MARKERS: &[&str] = &[
    ".cargo/registry",
    ".cargo/git",
    "/rustc/",
    "/library/std/",
    "/library/core/",
    "/library/alloc/",
];

/// One frame of a captured stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl StackFrame {
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            file: Some(file.into()),
            line: Some(line),
            column: None,
        }
    }

    /// A frame with no source information (stripped binary, JIT, FFI)
    pub fn unresolved(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            file: None,
            line: None,
            column: None,
        }
    }
}

/// Ordered call stack, outermost caller first and innermost failure point last
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStack {
    frames: Vec<StackFrame>,
}

impl CapturedStack {
    pub fn new(frames: Vec<StackFrame>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Capture the current call stack, dropping the pipeline's own innermost frames
    #[inline(never)]
    pub fn capture() -> Self {
        let backtrace = Backtrace::force_capture();
        let mut innermost_first = parse_backtrace_text(&backtrace.to_string());
        let internal = innermost_first
            .iter()
            .take_while(|frame| is_internal_frame(&frame.function))
            .count();
        innermost_first.drain(..internal);
        innermost_first.reverse();
        Self::new(innermost_first)
    }

    /// Adapt an already captured backtrace (for example one carried by `anyhow::Error`)
    pub fn from_backtrace(backtrace: &Backtrace) -> Self {
        Self::parse(&backtrace.to_string())
    }

    /// Parse the textual form produced by `std::backtrace::Backtrace`'s `Display`
    pub fn parse(text: &str) -> Self {
        let mut frames = parse_backtrace_text(text);
        frames.reverse();
        Self::new(frames)
    }

    /// Human-readable trace, most recent call last
    pub fn format(&self, exception: &ExceptionInfo) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}: {}", exception.type_name, exception.message);
        for cause in &exception.causes {
            let _ = writeln!(out, "  caused by: {}", cause);
        }
        out.push_str("Stack (most recent call last):");
        for (index, frame) in self.frames.iter().enumerate() {
            let _ = write!(out, "\n  {:>3}: {}", index, frame.function);
            if let (Some(file), Some(line)) = (&frame.file, frame.line) {
                let _ = write!(out, "\n         at {}:{}", file, line);
                if let Some(column) = frame.column {
                    let _ = write!(out, ":{}", column);
                }
            }
        }
        out
    }
}

/// Frames belonging to the standard library's capture machinery or to this crate
fn is_internal_frame(function: &str) -> bool {
    let function = function.trim_start_matches('<');
    function.starts_with("std::")
        || function.starts_with("core::")
        || function.starts_with("alloc::")
        || function.starts_with("__rust")
        || (function.contains("quill_telemetry::") && !function.contains("::tests::"))
}

/// Parse backtrace text into frames, innermost first (the order `Backtrace` prints)
fn parse_backtrace_text(text: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                if frame.file.is_none() {
                    let (file, line, column) = split_location(location);
                    frame.file = Some(file);
                    frame.line = line;
                    frame.column = column;
                }
            }
            continue;
        }

        let Some((index, rest)) = line.split_once(": ") else {
            continue;
        };
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }

        // Full style prefixes the symbol with its address: "0x55d1c0 - name"
        let name = match rest.split_once(" - ") {
            Some((addr, name)) if addr.trim_start().starts_with("0x") => name,
            _ => rest,
        };
        frames.push(StackFrame::unresolved(strip_symbol_hash(name.trim())));
    }

    frames
}

/// Split `path:line[:column]`, tolerating drive letters and missing numbers
fn split_location(location: &str) -> (String, Option<u32>, Option<u32>) {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next().unwrap_or_default();
    let middle = parts.next();
    let head = parts.next();

    match (head, middle.and_then(|m| m.parse::<u32>().ok()), last.parse::<u32>().ok()) {
        (Some(file), Some(line), Some(column)) => (file.to_string(), Some(line), Some(column)),
        (_, _, Some(line)) => {
            let file = match (head, middle) {
                (Some(h), Some(m)) => format!("{}:{}", h, m),
                (None, Some(m)) => m.to_string(),
                _ => String::new(),
            };
            (file, Some(line), None)
        }
        _ => (location.to_string(), None, None),
    }
}

fn strip_symbol_hash(name: &str) -> String {
    match name.rsplit_once("::h") {
        Some((head, hash)) if hash.len() == 16 && hash.bytes().all(|b| b.is_ascii_hexdigit()) => {
            head.to_string()
        }
        _ => name.to_string(),
    }
}

/// Find the blame frame: scanning from the innermost frame outwards, the first
/// frame with a source location that `is_foreign` does not reject.
pub fn find_blame_frame<F>(frames: &[StackFrame], is_foreign: F) -> Option<&StackFrame>
where
    F: Fn(&StackFrame) -> bool,
{
    frames
        .iter()
        .rev()
        .filter(|frame| frame.file.is_some() && frame.line.is_some())
        .find(|frame| !is_foreign(frame))
}

/// Applies the configured foreign-code markers and application root to captured stacks
#[derive(Debug, Clone)]
pub struct ErrorEnricher {
    foreign_markers: Vec<String>,
    app_root: Option<PathBuf>,
    include_stack_trace: bool,
}

impl ErrorEnricher {
    pub fn new(config: &EnrichmentConfig) -> Self {
        Self {
            foreign_markers: config
                .foreign_markers
                .iter()
                .map(|marker| marker.replace('\\', "/"))
                .collect(),
            app_root: config.app_root.clone(),
            include_stack_trace: config.capture_stack,
        }
    }

    pub fn is_foreign(&self, frame: &StackFrame) -> bool {
        let Some(file) = &frame.file else {
            return true;
        };
        let normalized = file.replace('\\', "/");
        self.foreign_markers
            .iter()
            .any(|marker| normalized.contains(marker.as_str()))
    }

    /// Locate the blame frame; `None` when the stack is empty or entirely foreign
    pub fn locate(&self, stack: &CapturedStack) -> Option<ErrorLocation> {
        let frame = find_blame_frame(stack.frames(), |f| self.is_foreign(f))?;
        Some(ErrorLocation {
            file: self.relative_path(frame.file.as_deref()?),
            line: frame.line?,
            function: frame.function.clone(),
        })
    }

    /// Rewrite `file` relative to the application root when it lies beneath it
    pub fn relative_path(&self, file: &str) -> String {
        if let Some(stripped) = file.strip_prefix("./").or_else(|| file.strip_prefix(".\\")) {
            return stripped.replace('\\', "/");
        }
        let path = Path::new(file);
        if let Some(root) = &self.app_root {
            if let Ok(relative) = path.strip_prefix(root) {
                return relative.to_string_lossy().replace('\\', "/");
            }
        }
        file.to_string()
    }

    /// Build the error details for an exception.
    ///
    /// Never fails: missing frames simply yield no `location` and no `stack_trace`.
    pub fn enrich(&self, exception: &ExceptionInfo) -> ErrorInfo {
        let mut info = ErrorInfo {
            type_name: Some(exception.type_name.clone()),
            message: Some(exception.message.clone()),
            location: None,
            stack_trace: None,
        };

        if let Some(stack) = exception.stack.as_ref().filter(|s| !s.is_empty()) {
            info.location = self.locate(stack);
            if self.include_stack_trace {
                info.stack_trace = Some(stack.format(exception));
            }
        }

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enricher(app_root: Option<&str>) -> ErrorEnricher {
        let mut config = EnrichmentConfig::default();
        config.app_root = app_root.map(PathBuf::from);
        ErrorEnricher::new(&config)
    }

    fn synthetic_stack() -> CapturedStack {
        CapturedStack::new(vec![
            StackFrame::new("my_service::handlers::get_user", "/srv/app/src/handlers.rs", 42),
            StackFrame::new(
                "serde_json::de::from_str",
                "/home/dev/.cargo/registry/src/index.crates.io-6f17d22bba15001f/serde_json-1.0.120/src/de.rs",
                2676,
            ),
            StackFrame::new(
                "core::result::unwrap_failed",
                "/rustc/07dca489ac2d933c78d3c5158e3f43beefeb02ce/library/core/src/result.rs",
                1654,
            ),
        ])
    }

    #[test]
    fn test_blame_skips_foreign_frames() {
        let location = enricher(Some("/srv/app")).locate(&synthetic_stack()).unwrap();

        assert_eq!(location.function, "my_service::handlers::get_user");
        assert_eq!(location.file, "src/handlers.rs");
        assert_eq!(location.line, 42);
        assert!(!location.file.contains(".cargo/registry"));
        assert!(!location.file.contains("/rustc/"));
    }

    #[test]
    fn test_innermost_application_frame_wins() {
        let stack = CapturedStack::new(vec![
            StackFrame::new("app::main", "/srv/app/src/main.rs", 5),
            StackFrame::new("app::service::run", "/srv/app/src/service.rs", 17),
            StackFrame::new("tokio::runtime::poll", "/x/.cargo/registry/src/tokio/rt.rs", 9),
        ]);

        let location = enricher(Some("/srv/app")).locate(&stack).unwrap();
        assert_eq!(location.function, "app::service::run");
    }

    #[test]
    fn test_all_foreign_stack_has_no_location() {
        let stack = CapturedStack::new(vec![
            StackFrame::new("std::rt::lang_start", "/rustc/abc/library/std/src/rt.rs", 1),
            StackFrame::new("tokio::spawn", "/u/.cargo/registry/src/tokio/task.rs", 2),
        ]);

        assert!(enricher(None).locate(&stack).is_none());
    }

    #[test]
    fn test_frames_without_source_are_never_blamed() {
        let stack = CapturedStack::new(vec![
            StackFrame::new("app::main", "/srv/app/src/main.rs", 3),
            StackFrame::unresolved("<unknown>"),
        ]);

        let location = enricher(Some("/srv/app")).locate(&stack).unwrap();
        assert_eq!(location.function, "app::main");
    }

    #[test]
    fn test_empty_stack_yields_type_and_message_only() {
        let exception = ExceptionInfo::new("IoError", "disk full");
        let info = enricher(None).enrich(&exception);

        assert_eq!(info.type_name.as_deref(), Some("IoError"));
        assert!(info.location.is_none());
        assert!(info.stack_trace.is_none());
    }

    #[test]
    fn test_enrich_formats_trace_most_recent_last() {
        let exception = ExceptionInfo::new("ParseError", "bad input").with_stack(synthetic_stack());
        let info = enricher(Some("/srv/app")).enrich(&exception);

        let trace = info.stack_trace.unwrap();
        assert!(trace.starts_with("ParseError: bad input"));
        let app = trace.find("get_user").unwrap();
        let core = trace.find("unwrap_failed").unwrap();
        assert!(app < core);
    }

    #[test]
    fn test_stack_trace_omitted_when_capture_disabled() {
        let mut config = EnrichmentConfig::default();
        config.capture_stack = false;
        config.app_root = Some(PathBuf::from("/srv/app"));

        let exception = ExceptionInfo::new("E", "m").with_stack(synthetic_stack());
        let info = ErrorEnricher::new(&config).enrich(&exception);

        assert!(info.stack_trace.is_none());
        assert!(info.location.is_some());
    }

    #[test]
    fn test_parse_short_backtrace_text() {
        let text = "   0: my_app::db::query
             at ./src/db.rs:88:17
   1: my_app::main
             at ./src/main.rs:12:5
   2: core::ops::function::FnOnce::call_once
             at /rustc/07dca489ac2d933c78d3c5158e3f43beefeb02ce/library/core/src/ops/function.rs:250:5
   3: <unknown>
";
        let stack = CapturedStack::parse(text);
        let frames = stack.frames();

        assert_eq!(frames.len(), 4);
        // outermost first
        assert_eq!(frames[0].function, "<unknown>");
        assert_eq!(frames[3].function, "my_app::db::query");
        assert_eq!(frames[3].file.as_deref(), Some("./src/db.rs"));
        assert_eq!(frames[3].line, Some(88));
        assert_eq!(frames[3].column, Some(17));

        let location = enricher(None).locate(&stack).unwrap();
        assert_eq!(location.file, "src/db.rs");
        assert_eq!(location.function, "my_app::db::query");
    }

    #[test]
    fn test_parse_full_style_with_addresses_and_hashes() {
        let text = "   0:     0x55d1c0b0 - my_app::run::h0123456789abcdef
                               at /srv/app/src/run.rs:7:9
   1:     0x55d1c0ff - <unknown>
";
        let stack = CapturedStack::parse(text);
        assert_eq!(stack.frames()[1].function, "my_app::run");
        assert_eq!(stack.frames()[1].line, Some(7));
    }

    #[test]
    fn test_split_location_variants() {
        assert_eq!(
            split_location("C:\\app\\src\\main.rs:10:2"),
            ("C:\\app\\src\\main.rs".to_string(), Some(10), Some(2))
        );
        assert_eq!(
            split_location("src/lib.rs:4"),
            ("src/lib.rs".to_string(), Some(4), None)
        );
        assert_eq!(split_location("weird"), ("weird".to_string(), None, None));
    }

    #[test]
    fn test_live_capture_never_panics() {
        let stack = CapturedStack::capture();
        let exception = ExceptionInfo::new("Live", "capture").with_stack(stack);
        let info = enricher(None).enrich(&exception);
        assert_eq!(info.message.as_deref(), Some("capture"));
    }
}
