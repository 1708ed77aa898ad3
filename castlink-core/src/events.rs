//! Session events for presentation-layer observers.
//!
//! Each observer gets its own FIFO through `tokio::sync::broadcast`.
//! Delivery is at-most-once: a lagging observer loses the oldest events
//! rather than slowing the session down.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::input::SpecialAction;
use crate::quality::Adjustment;
use crate::types::{ClientId, Resolution, TransportKind};

/// Events buffered per observer before the oldest are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Why a client left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A send failed or the sink's queue overflowed.
    SendFailed,
    /// Nothing heard within the liveness timeout.
    Timeout,
    /// The client said goodbye or the connection closed.
    Closed,
    /// A newer registration took over the same id.
    Replaced,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        resolution: Resolution,
        fps: u32,
    },
    ClientConnected {
        id: ClientId,
        kind: TransportKind,
        peer: SocketAddr,
    },
    ClientDisconnected {
        id: ClientId,
        reason: DisconnectReason,
    },
    QualityChanged(Adjustment),
    Special {
        client: ClientId,
        action: SpecialAction,
    },
    Stopped,
}

/// Cloneable publishing end of the event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new observer. It sees events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish to every current observer. No observers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
