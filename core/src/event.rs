use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Event key type
pub type EventKey = String;

/// Gateway event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Event key (e.g., "build.started", "rules.invalidated")
    pub key: EventKey,

    /// Image reference the event concerns, if any
    pub reference: Option<String>,

    /// Free-form detail (error text for failures)
    pub detail: Option<String>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl GatewayEvent {
    /// Create an event with no reference
    pub fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reference: None,
            detail: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event about a reference
    pub fn for_reference(key: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            ..Self::empty(key)
        }
    }

    /// Attach detail text
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<GatewayEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Trace every event until all emitters are dropped.
///
/// Returns the number of events traced.
pub async fn log_events(mut receiver: broadcast::Receiver<GatewayEvent>) -> u64 {
    let mut traced = 0;
    loop {
        match receiver.recv().await {
            Ok(event) => {
                traced += 1;
                if event.key == events::BUILD_FAILED {
                    tracing::warn!(
                        key = %event.key,
                        reference = ?event.reference,
                        detail = ?event.detail,
                        "Gateway event"
                    );
                } else {
                    tracing::debug!(
                        key = %event.key,
                        reference = ?event.reference,
                        detail = ?event.detail,
                        "Gateway event"
                    );
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event log fell behind");
            }
            Err(RecvError::Closed) => return traced,
        }
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // Build events
    pub const BUILD_STARTED: &str = "build.started";
    pub const BUILD_COMPLETED: &str = "build.completed";
    pub const BUILD_FAILED: &str = "build.failed";
    pub const BUILD_UNMATCHED: &str = "build.unmatched";

    // Rule events
    pub const RULES_INVALIDATED: &str = "rules.invalidated";
    pub const RULES_REBUILT: &str = "rules.rebuilt";
}
