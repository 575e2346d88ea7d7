//! Broker destinations the monitor itself writes to or subscribes.
//!
//! Agent hand-off queues belong to the agents; the monitor never targets
//! them and [`crate::broker::BrokerConnection::send`] takes any path.

/// Where a frame is sent or subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Operator commands for the workflow runner.
    Control,
    /// The shared topic every agent publishes on.
    Broadcast(String),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Control => f.write_str("/queue/workflow_control"),
            Destination::Broadcast(topic) => write!(f, "/topic/{topic}"),
        }
    }
}
