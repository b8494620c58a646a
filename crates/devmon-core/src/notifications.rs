use crate::activity::{Depth, StoredEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorNotification {
    Capture { event: StoredEvent },
    Observation { text: String, depth: Depth },
    Status { message: String },
    Error { message: String },
}

impl MonitorNotification {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Capture { .. } => "capture",
            Self::Observation { .. } => "observation",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
        }
    }
}

/// Fan-out of pipeline output to independent subscribers.
///
/// Publishing never blocks and succeeds with zero subscribers; slow
/// subscribers lose the oldest notifications.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<MonitorNotification>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorNotification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: MonitorNotification) {
        let _ = self.tx.send(notification);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.publish(MonitorNotification::status(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(MonitorNotification::error(message));
    }
}
