//! Endpoint lifecycle events for status broadcasting.
//!
//! Uses `tokio::sync::broadcast` so multiple subscribers can observe the
//! supervisor without coupling to it. The health loop drains `ChildExited`
//! to drive immediate reconnects; other events exist for observability.

use tokio::sync::broadcast;

/// Endpoint lifecycle event emitted by the supervisor.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// A connection attempt for the cluster has started.
    Connecting {
        /// Normalized cluster URL
        cluster: String,
    },

    /// The cluster's child process connected and reported its tools.
    Connected {
        /// Normalized cluster URL
        cluster: String,
        /// Number of tools discovered
        tool_count: usize,
    },

    /// A health ping failed.
    PingFailed {
        /// Normalized cluster URL
        cluster: String,
        /// Consecutive failures including this one
        failures: u32,
    },

    /// The child process exited on its own.
    ///
    /// Emitted exactly once per tracked child exit; intentional teardown
    /// does not produce this event.
    ChildExited {
        /// Normalized cluster URL
        cluster: String,
    },

    /// A reconnect attempt is in progress.
    Reconnecting {
        /// Normalized cluster URL
        cluster: String,
    },
}

impl EndpointEvent {
    /// Get the cluster URL from any event variant.
    pub fn cluster(&self) -> &str {
        match self {
            EndpointEvent::Connecting { cluster } => cluster,
            EndpointEvent::Connected { cluster, .. } => cluster,
            EndpointEvent::PingFailed { cluster, .. } => cluster,
            EndpointEvent::ChildExited { cluster } => cluster,
            EndpointEvent::Reconnecting { cluster } => cluster,
        }
    }
}

/// Broadcast sender for endpoint events.
///
/// Clone this to share between components that emit events.
/// Sending to zero receivers silently succeeds.
#[derive(Clone)]
pub struct EndpointEventSender {
    tx: broadcast::Sender<EndpointEvent>,
}

impl EndpointEventSender {
    /// Create a new event sender with the specified buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send an event to all subscribers, ignoring lag and absence.
    pub fn send(&self, event: EndpointEvent) {
        let _ = self.tx.send(event);
    }

    /// Create a new subscriber to receive events.
    pub fn subscribe(&self) -> EndpointEventReceiver {
        EndpointEventReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EndpointEventSender {
    fn default() -> Self {
        Self::new(16)
    }
}

/// Receiver for endpoint events.
///
/// A lagged receiver skips missed events rather than blocking the sender.
pub struct EndpointEventReceiver {
    rx: broadcast::Receiver<EndpointEvent>,
}

impl EndpointEventReceiver {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` once the sender is dropped.
    pub async fn recv(&mut self) -> Option<EndpointEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without waiting.
    pub fn try_recv(&mut self) -> Option<EndpointEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }
}
