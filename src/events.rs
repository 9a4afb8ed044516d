//! Lifecycle events published to API subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// A lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Object type, `container` or `image`
    pub kind: String,
    /// Action such as `create`, `start`, `die`, `oom`, `commit`
    pub action: String,
    /// ID of the object the event is about
    pub id: String,
    pub attributes: HashMap<String, String>,
    pub time: DateTime<Utc>,
}

impl Event {
    pub fn container(action: &str, id: &str) -> Self {
        Self {
            kind: "container".to_string(),
            action: action.to_string(),
            id: id.to_string(),
            attributes: HashMap::new(),
            time: Utc::now(),
        }
    }

    pub fn image(action: &str, id: &str) -> Self {
        Self {
            kind: "image".to_string(),
            ..Self::container(action, id)
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Fan-out of lifecycle events
#[derive(Clone)]
pub struct EventsService {
    sender: broadcast::Sender<Event>,
}

impl EventsService {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn publish(&self, event: Event) {
        tracing::debug!(kind = %event.kind, action = %event.action, id = %event.id, "event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventsService {
    fn default() -> Self {
        Self::new(256)
    }
}
