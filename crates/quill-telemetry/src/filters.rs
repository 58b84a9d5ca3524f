//! Filters for the tracing bridge

use tracing::{Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Filter};

/// Target prefix of the crate's own diagnostics
pub const SELF_TARGET: &str = "quill_telemetry";

/// Blocks the pipeline's own diagnostics from re-entering the pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfTargetFilter;

impl SelfTargetFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn allows(target: &str) -> bool {
        !target.starts_with(SELF_TARGET)
    }
}

impl<S> Filter<S> for SelfTargetFilter
where
    S: Subscriber,
{
    fn enabled(&self, meta: &Metadata<'_>, _ctx: &Context<'_, S>) -> bool {
        Self::allows(meta.target())
    }

    fn callsite_enabled(&self, meta: &Metadata<'_>) -> tracing::subscriber::Interest {
        if Self::allows(meta.target()) {
            tracing::subscriber::Interest::sometimes()
        } else {
            tracing::subscriber::Interest::never()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_targets_are_blocked() {
        assert!(!SelfTargetFilter::allows("quill_telemetry"));
        assert!(!SelfTargetFilter::allows("quill_telemetry::rotation"));
        assert!(SelfTargetFilter::allows("quill_cli"));
        assert!(SelfTargetFilter::allows("hyper::client"));
    }
}
