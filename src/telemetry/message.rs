//! Per-message span helpers.
//!
//! Every inbound broker message is routed inside one `message.route` span;
//! workflow state changes are recorded as events on it.

use tracing::Span;

/// Start a span for routing one inbound message.
///
/// `msg.kind` and `workflow.id` are declared empty and filled in once the
/// message has been classified and correlated.
pub fn start_message_span(destination: &str) -> Span {
    tracing::info_span!(
        "message.route",
        "msg.destination" = destination,
        "msg.kind" = tracing::field::Empty,
        "msg.type" = tracing::field::Empty,
        "workflow.id" = tracing::field::Empty,
    )
}

/// Record a workflow state transition as an event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
