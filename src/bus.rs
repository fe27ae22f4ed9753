//! In-process event bus
//!
//! The sync engine publishes one [`ChangeEvent`] per applied remote change;
//! the dispatch coordinator drains them from a subscription and fans them out
//! to plugins. Each subscriber gets its own unbounded channel, so a slow
//! consumer never blocks the engine.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::domain::{Entity, EntityId};

/// Kind of change an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::EntityCreated,
        EventKind::EntityUpdated,
        EventKind::EntityDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EntityCreated => "entity_created",
            EventKind::EntityUpdated => "entity_updated",
            EventKind::EntityDeleted => "entity_deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity_created" => Ok(EventKind::EntityCreated),
            "entity_updated" => Ok(EventKind::EntityUpdated),
            "entity_deleted" => Ok(EventKind::EntityDeleted),
            other => Err(format!("Unknown event kind '{}'", other)),
        }
    }
}

/// One remote change, as seen by plugins
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Publish order on the bus (strictly increasing)
    pub seq: u64,

    pub kind: EventKind,

    /// Entity state after the change
    pub entity: Arc<Entity>,
}

impl ChangeEvent {
    pub fn entity_id(&self) -> &EntityId {
        &self.entity.id
    }
}

#[derive(Debug, Default)]
struct BusState {
    next_seq: u64,
    subscribers: Vec<UnboundedSender<ChangeEvent>>,
}

/// Publish point from the engine to dispatch
#[derive(Debug, Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event to every live subscriber and returns its sequence number
    ///
    /// Sequence assignment and delivery happen under one lock, so every
    /// subscriber sees events in sequence order.
    pub fn publish(&self, kind: EventKind, entity: Entity) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        state.next_seq += 1;
        let event = ChangeEvent {
            seq: state.next_seq,
            kind,
            entity: Arc::new(entity),
        };

        // Drop subscribers whose receiving end is gone
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());

        event.seq
    }

    /// Registers a subscriber that receives every event published from now on
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .subscribers
            .push(tx);
        EventSubscription { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .subscribers
            .len()
    }
}

/// Receiving end of a bus subscription
#[derive(Debug)]
pub struct EventSubscription {
    rx: UnboundedReceiver<ChangeEvent>,
}

impl EventSubscription {
    /// Takes every event queued so far without waiting
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Waits for the next event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}
