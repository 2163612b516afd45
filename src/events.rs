use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::state::Step;

/// Event type carried by every step event.
pub const STEP_EVENT_TYPE: &str = "streamingStepEvent";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub event_type: &'static str,
    pub time: DateTime<Utc>,
    pub step: Step,
}

/// Fire-and-forget fan-out of persisted steps to live listeners.
#[derive(Debug, Clone)]
pub struct StepEvents {
    sender: broadcast::Sender<StepEvent>,
}

impl StepEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.sender.subscribe()
    }

    pub fn has_listeners(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Publish a step that has already been persisted. Dropped when nobody listens.
    pub fn publish(&self, step: &Step) {
        if !self.has_listeners() {
            return;
        }
        let event = StepEvent {
            event_type: STEP_EVENT_TYPE,
            time: Utc::now(),
            step: step.clone(),
        };
        if self.sender.send(event).is_err() {
            trace!(flow_id = %step.flow_id, "Step event dropped, listener went away");
        }
    }
}

impl Default for StepEvents {
    fn default() -> Self {
        Self::new(256)
    }
}
