//! Metric instrument factories for swf-monitor.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"swf-monitor"` meter.

use opentelemetry::metrics::{Counter, Meter};

/// Returns the shared meter for swf-monitor instruments.
fn meter() -> Meter {
    opentelemetry::global::meter(super::SERVICE_NAME)
}

/// Counter: inbound broker messages.
/// Labels: `kind` ("heartbeat" | "pipeline").
pub fn messages_received() -> Counter<u64> {
    meter()
        .u64_counter("swf.messages.received")
        .with_description("Number of inbound broker messages classified")
        .build()
}

/// Counter: inbound messages dropped before routing.
/// Labels: `reason` ("malformed" | "unclassified").
pub fn messages_discarded() -> Counter<u64> {
    meter()
        .u64_counter("swf.messages.discarded")
        .with_description("Number of inbound messages discarded")
        .build()
}

/// Counter: workflow status transitions.
/// Labels: `from`, `to`.
pub fn workflow_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("swf.workflow.state_transitions")
        .with_description("Number of workflow status transitions")
        .build()
}

/// Counter: events enqueued to subscribers.
pub fn broadcast_delivered() -> Counter<u64> {
    meter()
        .u64_counter("swf.broadcast.delivered")
        .with_description("Events enqueued to stream subscribers")
        .build()
}

/// Counter: events evicted from a full subscriber queue.
pub fn broadcast_dropped() -> Counter<u64> {
    meter()
        .u64_counter("swf.broadcast.dropped")
        .with_description("Events evicted from full subscriber queues")
        .build()
}

/// Counter: broker connection attempts.
/// Labels: `result` ("ok" | "error"), `attempt` ("initial" | "reconnect").
pub fn broker_connects() -> Counter<u64> {
    meter()
        .u64_counter("swf.broker.connects")
        .with_description("Broker connection attempts")
        .build()
}

/// Counter: persistence writes that failed and were skipped.
/// Labels: `record` ("agent" | "workflow" | "stage" | "event").
pub fn persistence_failures() -> Counter<u64> {
    meter()
        .u64_counter("swf.persistence.failures")
        .with_description("Persistence writes that failed")
        .build()
}
