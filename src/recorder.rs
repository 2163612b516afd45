use std::sync::Arc;

use crate::error::Result;
use crate::events::StepEvents;
use crate::state::{FlowState, Snapshot, Step};
use crate::storage::Store;

/// Write path shared by synchronous callers and ingestion workers.
/// Steps are announced on the event channel only after the store accepted them.
pub struct Recorder {
    store: Arc<dyn Store>,
    events: StepEvents,
}

impl Recorder {
    pub fn new(store: Arc<dyn Store>, events: StepEvents) -> Self {
        Self { store, events }
    }

    pub fn events(&self) -> &StepEvents {
        &self.events
    }

    pub async fn save_step(&self, step: &Step) -> Result<()> {
        self.store.save_step(step).await?;
        self.events.publish(step);
        Ok(())
    }

    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.store.save_snapshot(snapshot).await
    }

    pub async fn record_start(&self, state: &FlowState) -> Result<()> {
        self.store.record_start(state).await
    }

    pub async fn record_end(&self, state: &FlowState) -> Result<()> {
        self.store.record_end(state).await
    }
}
