//! Connection state, connection events and the trace sink.

use crate::jsonrpc::Envelope;
use std::sync::Mutex;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Emitted on every state transition.
///
/// `error` is set only when the transition was caused by a failure (launch
/// error, read error). A peer process that simply exits produces a
/// `Disconnected` event with no error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub error: Option<String>,
}

/// Current state plus a broadcast of transitions.
pub(crate) struct ConnectionSignal {
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionSignal {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            events,
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`, emitting an event if the state actually changed.
    pub(crate) fn transition(&self, next: ConnectionState, error: Option<String>) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                return false;
            }
            *state = next;
        }
        // No subscribers is fine.
        let _ = self.events.send(ConnectionEvent { state: next, error });
        true
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

/// Direction of a traced message relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Observer for connection and message traffic.
pub trait TraceSink: Send + Sync {
    fn connection(&self, server: &str, event: &ConnectionEvent);
    fn message(&self, server: &str, direction: Direction, envelope: &Envelope);
}

/// Default sink: everything goes to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn connection(&self, server: &str, event: &ConnectionEvent) {
        match &event.error {
            Some(err) => tracing::warn!("MCP server '{server}' {:?}: {err}", event.state),
            None => tracing::debug!("MCP server '{server}' {:?}", event.state),
        }
    }

    fn message(&self, server: &str, direction: Direction, envelope: &Envelope) {
        let arrow = match direction {
            Direction::Outbound => "->",
            Direction::Inbound => "<-",
        };
        match envelope {
            Envelope::Request(r) => {
                tracing::trace!("[{server}] {arrow} request {} {}", r.id, r.method)
            }
            Envelope::Notification(n) => {
                tracing::trace!("[{server}] {arrow} notification {}", n.method)
            }
            Envelope::Response(r) => tracing::trace!("[{server}] {arrow} response {}", r.id),
        }
    }
}
