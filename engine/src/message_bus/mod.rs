//! Message Bus for operation progress events
//!
//! The MessageBus lets observers (the CLI progress printer, tests) follow an
//! operation without the engine knowing about them. Each subscriber gets a
//! bounded channel. Publishing never waits: an event for a subscriber whose
//! channel is full or closed is dropped, so a slow observer cannot stall an
//! operation.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::operation::OperationState;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    OperationStarted,
    LinkApplied,
    LinkFinished,
    FactLearned,
    StateChanged,
    OperationFinished,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone)]
pub enum Event {
    OperationStarted {
        operation_id: String,
        name: String,
    },
    /// A link was appended to the chain
    LinkApplied {
        operation_id: String,
        link_id: String,
        ability: String,
        paw: String,
        command: String,
    },
    LinkFinished {
        operation_id: String,
        link_id: String,
        status: i32,
    },
    FactLearned {
        operation_id: String,
        trait_name: String,
        value: String,
    },
    StateChanged {
        operation_id: String,
        state: OperationState,
    },
    OperationFinished {
        operation_id: String,
        state: OperationState,
        links: usize,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::OperationStarted { .. } => EventType::OperationStarted,
            Event::LinkApplied { .. } => EventType::LinkApplied,
            Event::LinkFinished { .. } => EventType::LinkFinished,
            Event::FactLearned { .. } => EventType::FactLearned,
            Event::StateChanged { .. } => EventType::StateChanged,
            Event::OperationFinished { .. } => EventType::OperationFinished,
        }
    }
}

/// Message bus for pub/sub communication between components
pub struct MessageBus {
    /// Map of event types to lists of subscribers
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to subscribers of its type and of `EventType::All`
    ///
    /// Closed subscribers are pruned.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(?event_type, "Subscriber full, event dropped");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
