use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;
use crate::events::{StepEvent, StepEvents};
use crate::ingest::{IngestionPipeline, Payload};
use crate::reconcile::Task;
use crate::recorder::Recorder;
use crate::state::*;
use crate::storage::{Backend, Store};

/// Tuning for the asynchronous write path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Worker count; defaults to the backend's concurrency budget.
    pub workers: Option<usize>,
    /// Maximum number of queued payloads; unbounded when unset.
    pub queue_capacity: Option<usize>,
}

/// Everything a request handler needs, built once at startup and shared.
pub struct FlowStateService {
    store: Arc<dyn Store>,
    recorder: Arc<Recorder>,
    pipeline: IngestionPipeline,
}

impl FlowStateService {
    pub async fn open(backend: &Backend, options: &IngestOptions) -> Result<Self> {
        let store = backend.open().await?;
        Ok(Self::with_store(store, options))
    }

    pub fn with_store(store: Arc<dyn Store>, options: &IngestOptions) -> Self {
        let recorder = Arc::new(Recorder::new(store.clone(), StepEvents::default()));
        let workers = options.workers.unwrap_or_else(|| store.max_concurrency());
        let pipeline = IngestionPipeline::start(recorder.clone(), workers, options.queue_capacity);
        info!(backend = store.name(), workers, "Flow state service ready");
        Self {
            store,
            recorder,
            pipeline,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.recorder.events().subscribe()
    }

    // Synchronous writes: return once the backend has the data.

    pub async fn save_step(&self, step: &Step) -> Result<()> {
        self.recorder.save_step(step).await
    }

    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.recorder.save_snapshot(snapshot).await
    }

    pub async fn record_start(&self, state: &FlowState) -> Result<()> {
        self.recorder.record_start(state).await
    }

    pub async fn record_end(&self, state: &FlowState) -> Result<()> {
        self.recorder.record_end(state).await
    }

    // Asynchronous writes: acknowledged once queued, failures are only logged.

    pub async fn submit_step(&self, raw: impl Into<Vec<u8>>) -> Result<()> {
        self.pipeline.submit(Payload::Step(raw.into())).await
    }

    pub async fn submit_snapshot(&self, raw: impl Into<Vec<u8>>) -> Result<()> {
        self.pipeline.submit(Payload::Snapshot(raw.into())).await
    }

    pub async fn submit_flow_start(&self, raw: impl Into<Vec<u8>>) -> Result<()> {
        self.pipeline.submit(Payload::FlowStart(raw.into())).await
    }

    pub async fn submit_flow_end(&self, raw: impl Into<Vec<u8>>) -> Result<()> {
        self.pipeline.submit(Payload::FlowEnd(raw.into())).await
    }

    pub async fn pending_writes(&self) -> usize {
        self.pipeline.pending().await
    }

    // Reads.

    pub async fn list_flows(&self, filter: &FlowFilter) -> Result<FlowRecord> {
        self.store.get_flows_with_record_count(filter).await
    }

    pub async fn failed_flows(&self, filter: &FlowFilter) -> Result<Vec<FlowInfo>> {
        self.store.get_failed_flows(filter).await
    }

    pub async fn completed_flows(&self, filter: &FlowFilter) -> Result<Vec<FlowInfo>> {
        self.store.get_completed_flows(filter).await
    }

    pub async fn flow(&self, flow_id: &str) -> Result<Option<FlowInfo>> {
        self.store.get_flow(flow_id, &FlowFilter::default()).await
    }

    pub async fn status(&self, flow_id: &str) -> Result<Option<i32>> {
        self.store.get_status(flow_id).await
    }

    pub async fn steps(&self, flow_id: &str) -> Result<Vec<Step>> {
        self.store.get_steps(flow_id).await
    }

    pub async fn steps_as_tasks(&self, flow_id: &str) -> Result<Vec<Vec<Task>>> {
        self.store.get_steps_as_tasks(flow_id).await
    }

    pub async fn steps_status(&self, flow_id: &str) -> Result<Vec<StepStatus>> {
        self.store.get_steps_status(flow_id).await
    }

    pub async fn task_detail(
        &self,
        flow_id: &str,
        step_id: i64,
        task_name: Option<&str>,
    ) -> Result<Vec<Task>> {
        self.store.get_task_detail(flow_id, step_id, task_name).await
    }

    pub async fn snapshot(&self, flow_id: &str) -> Result<Option<Snapshot>> {
        self.store.get_snapshot(flow_id).await
    }

    pub async fn snapshot_at(&self, flow_id: &str, step_id: i64) -> Result<Option<Snapshot>> {
        self.store.get_snapshot_at(flow_id, step_id).await
    }

    pub async fn flow_names(&self, filter: &FlowFilter) -> Result<Vec<String>> {
        self.store.get_flow_names(filter).await
    }

    pub async fn app_versions(&self, filter: &FlowFilter) -> Result<Vec<String>> {
        self.store.get_app_versions(filter).await
    }

    pub async fn app_state(&self, user_id: &str, app_name: &str) -> Result<Option<AppState>> {
        self.store.get_app_state(user_id, app_name).await
    }

    pub async fn save_app_state(&self, state: &AppState) -> Result<()> {
        self.store.save_app_state(state).await
    }

    pub async fn delete_flow(&self, flow_id: &str) -> Result<()> {
        self.store.delete_flow(flow_id).await
    }

    pub async fn delete_steps(&self, flow_id: &str, from_step_id: i64) -> Result<()> {
        self.store.delete_steps(flow_id, from_step_id).await
    }

    /// Drain queued writes and stop the workers.
    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
    }
}
