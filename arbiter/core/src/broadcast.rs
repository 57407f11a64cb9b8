//! Event Broadcaster
//!
//! Every attached connection, registered or spectating, gets a bounded
//! outbound channel. The broadcaster fans events out to all of them with
//! `try_send`, so a slow or dead socket only loses its own events.
//!
//! # Architecture
//!
//! ```text
//!                        Broadcaster
//!                ┌─────────────────────────────────────────┐
//!                │ HashMap<ConnectionId, ConnectionHandle> │
//!                │   wrapped in Arc<RwLock<>>              │
//!                └───────────────────┬─────────────────────┘
//!                                    │ try_send
//!             ┌──────────────────────┼──────────────────────┐
//!             │                      │                      │
//!      ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!      │  operator   │       │   operator   │       │  spectator   │
//!      │   conn-1    │       │    conn-2    │       │    conn-3    │
//!      └─────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! The arbiter task and the dispatch worker both hold clones; reads (sends)
//! vastly outnumber writes (attach/detach).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::messages::{MessageKind, OutboundEvent, TurnSnapshot};
use crate::session::ConnectionId;

/// Outbound side of one attached connection
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Connection identifier
    pub id: ConnectionId,
    /// Channel to the connection's writer task
    pub tx: mpsc::Sender<OutboundEvent>,
    /// Network origin (peer address)
    pub origin: String,
    /// When the connection attached
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Create a handle for a freshly accepted connection
    #[must_use]
    pub fn new(id: ConnectionId, origin: impl Into<String>, tx: mpsc::Sender<OutboundEvent>) -> Self {
        Self {
            id,
            tx,
            origin: origin.into(),
            connected_at: Instant::now(),
        }
    }

    /// Queue an event without waiting
    ///
    /// Returns true if the event was queued.
    #[must_use]
    pub fn try_send(&self, event: OutboundEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    /// Check if the writer side is still alive
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Connections that accepted the event
    pub successful: usize,
    /// Connections whose channel was full or closed
    pub failed: usize,
    /// IDs of connections that failed
    pub failed_ids: Vec<ConnectionId>,
}

impl BroadcastResult {
    /// Check if every recipient accepted the event
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Fan-out to all attached connections
#[derive(Clone, Default)]
pub struct Broadcaster {
    inner: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
}

impl Broadcaster {
    /// Create an empty broadcaster
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection
    pub fn attach(&self, handle: ConnectionHandle) {
        let id = handle.id;
        let origin = handle.origin.clone();
        self.inner.write().insert(id, handle);
        tracing::info!(connection_id = %id, origin = %origin, "Connection attached");
    }

    /// Detach a connection
    pub fn detach(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let handle = self.inner.write().remove(&id);
        if handle.is_some() {
            tracing::info!(connection_id = %id, "Connection detached");
        }
        handle
    }

    /// Origin recorded when the connection attached
    #[must_use]
    pub fn origin_of(&self, id: ConnectionId) -> Option<String> {
        self.inner.read().get(&id).map(|h| h.origin.clone())
    }

    /// Number of attached connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if a connection is attached
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().contains_key(&id)
    }

    /// Send an event to every attached connection
    pub fn broadcast(&self, event: &OutboundEvent) -> BroadcastResult {
        let inner = self.inner.read();
        let mut result = BroadcastResult::default();

        for (id, handle) in inner.iter() {
            if handle.try_send(event.clone()) {
                result.successful += 1;
            } else {
                result.failed += 1;
                result.failed_ids.push(*id);
            }
        }

        if !result.all_succeeded() {
            tracing::debug!(
                event = event.name(),
                failed = result.failed,
                "Broadcast dropped for some connections"
            );
        }
        result
    }

    /// Send an event to one connection
    ///
    /// Returns true if the event was queued.
    pub fn send_to(&self, id: ConnectionId, event: OutboundEvent) -> bool {
        let inner = self.inner.read();
        if let Some(handle) = inner.get(&id) {
            handle.try_send(event)
        } else {
            tracing::warn!(
                connection_id = %id,
                event = event.name(),
                "Attempted to send to unknown connection"
            );
            false
        }
    }

    /// Broadcast the roster
    pub fn broadcast_roster(&self, names: Vec<String>) -> BroadcastResult {
        self.broadcast(&OutboundEvent::RosterUpdate { names })
    }

    /// Broadcast the holder state
    pub fn broadcast_turn(&self, snapshot: TurnSnapshot) -> BroadcastResult {
        self.broadcast(&OutboundEvent::TurnUpdate(snapshot))
    }

    /// Broadcast a feed message
    pub fn broadcast_message(&self, kind: MessageKind, text: impl Into<String>) -> BroadcastResult {
        self.broadcast(&OutboundEvent::message(kind, text))
    }

    /// Broadcast the hardware link state
    pub fn broadcast_hardware(&self, connected: bool) -> BroadcastResult {
        self.broadcast(&OutboundEvent::HardwareStatus { connected })
    }

    /// Detach every connection whose writer has gone away
    ///
    /// Returns the IDs that were removed.
    pub fn cleanup_disconnected(&self) -> Vec<ConnectionId> {
        let mut inner = self.inner.write();
        let dead: Vec<ConnectionId> = inner
            .iter()
            .filter(|(_, h)| !h.is_connected())
            .map(|(id, _)| *id)
            .collect();

        for id in &dead {
            inner.remove(id);
            tracing::info!(connection_id = %id, "Removed disconnected connection");
        }
        dead
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("connections", &self.count())
            .finish()
    }
}
