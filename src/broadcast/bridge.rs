//! Fan-in from the internal announcement channel into the broadcaster.
//!
//! Request handlers announce events through an [`InternalPublisher`]
//! instead of the broker. A single bridge task owns the receiving end and
//! republishes each event.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Broadcaster;
use crate::event::MonitorEvent;

/// Capacity of the internal channel.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Sending half of the internal channel.
#[derive(Clone)]
pub struct InternalPublisher {
    tx: mpsc::Sender<MonitorEvent>,
}

impl InternalPublisher {
    /// Create the channel. Hand the receiver to [`spawn_bridge`].
    pub fn channel() -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queue an event for broadcast. Returns false if the channel is full or closed.
    pub fn announce(&self, event: MonitorEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(msg_type = %event.msg_type, "internal channel full, announcement dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(msg_type = %event.msg_type, "internal channel closed, announcement dropped");
                false
            }
        }
    }
}

/// Spawn the bridge task. It ends when every publisher has been dropped.
pub fn spawn_bridge(broadcaster: Broadcaster, mut rx: mpsc::Receiver<MonitorEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("internal channel bridge started");
        while let Some(event) = rx.recv().await {
            broadcaster.publish(&event);
        }
        info!("internal channel closed, bridge stopped");
    })
}
