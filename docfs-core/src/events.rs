use serde::Serialize;
use tokio::sync::broadcast;

/// Notifications about metadata and sharing changes, published for external delivery.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    Created { path: String },
    Updated { path: String },
    Deleted { path: String },
    Renamed { from: String, to: String },
    Shared { id: String, path: String, principal: String },
    Unshared { id: String, path: String, principal: String },
    ShareDeferred { id: String, principal: String, perms: String },
    FriendRequested { login: String },
    FriendAccepted { login: String },
    Blocked { login: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
