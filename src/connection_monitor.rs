//! Connection state machine fed by realtime subscription lifecycle events.

use std::sync::Mutex;

use log::{debug, info};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::lock_or_recover;
use crate::model::ConnectionState;
use crate::protocol::{ConnectionMessage, Message};

/// Lifecycle events reported by the realtime subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Subscribed,
    Error,
    Timeout,
    Closed,
}

/// Tracks connectivity and broadcasts every transition on the bus.
pub struct ConnectionMonitor {
    state: Mutex<ConnectionState>,
    bus_producer: Sender<Message>,
}

impl ConnectionMonitor {
    pub fn new(bus_producer: Sender<Message>) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            bus_producer,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock_or_recover(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver for connection transitions (and the rest of the bus).
    pub fn subscribe(&self) -> Receiver<Message> {
        self.bus_producer.subscribe()
    }

    /// Maps a lifecycle event onto the state machine.
    ///
    /// A failure while connected moves to `Reconnecting`; a failure while not
    /// connected stays `Disconnected`. `Closed` always disconnects.
    pub fn handle_lifecycle(&self, event: LifecycleEvent) -> ConnectionState {
        let current = self.state();
        let next = match event {
            LifecycleEvent::Subscribed => ConnectionState::Connected,
            LifecycleEvent::Error | LifecycleEvent::Timeout => match current {
                ConnectionState::Connected | ConnectionState::Reconnecting => {
                    ConnectionState::Reconnecting
                }
                ConnectionState::Disconnected => ConnectionState::Disconnected,
            },
            LifecycleEvent::Closed => ConnectionState::Disconnected,
        };
        self.transition(next);
        next
    }

    /// Sets the state directly, notifying subscribers when it changed.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let previous = {
            let mut state = lock_or_recover(&self.state);
            let previous = *state;
            if previous == next {
                return false;
            }
            *state = next;
            previous
        };
        if next == ConnectionState::Connected {
            info!("ConnectionMonitor: {} -> {}", previous, next);
        } else {
            debug!("ConnectionMonitor: {} -> {}", previous, next);
        }
        let _ = self
            .bus_producer
            .send(Message::Connection(ConnectionMessage::StateChanged {
                previous,
                current: next,
            }));
        true
    }
}
