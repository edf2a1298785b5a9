//! Spans and structured events.

use tracing::{Level, Span, span};

/// Span covering one pipeline run.
///
/// ```rust,ignore
/// let span = span_pipeline("tilecast");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_pipeline(name: &str) -> Span {
    span!(Level::INFO, "pipeline", name = %name)
}

/// Span covering the task of one node.
#[inline]
pub fn span_node(node: &str, kind: &str) -> Span {
    span!(Level::DEBUG, "node", node = %node, kind = %kind)
}

/// Log a controller state transition.
#[inline]
pub fn trace_state_change(from: &str, to: &str) {
    tracing::debug!(from = %from, to = %to, "pipeline state changed");
}
