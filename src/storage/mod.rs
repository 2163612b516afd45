pub mod memory;
pub mod relational;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::reconcile::{self, Task, TaskReconciler};
use crate::state::*;

pub use memory::MemoryStore;
pub use relational::{RelationalSettings, RelationalStore};

/// Persistence façade for flow instances, their step logs and snapshots.
///
/// Absent instances, steps and snapshots are reported as `None` or an empty
/// list rather than as errors.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert a step keyed by `(flow_id, id)`.
    async fn save_step(&self, step: &Step) -> Result<()>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Create (or refresh) the instance record when a run starts.
    async fn record_start(&self, state: &FlowState) -> Result<()>;

    /// Close the instance record with end time, status and outputs.
    async fn record_end(&self, state: &FlowState) -> Result<()>;

    /// The step log of one instance, ordered by step id.
    async fn get_steps(&self, flow_id: &str) -> Result<Vec<Step>>;

    /// The most recent stored snapshot, without falling back to the step log.
    async fn load_snapshot(&self, flow_id: &str) -> Result<Option<Snapshot>>;

    /// Current root-flow status code of an instance.
    async fn get_status(&self, flow_id: &str) -> Result<Option<i32>>;

    async fn get_flow(&self, flow_id: &str, filter: &FlowFilter) -> Result<Option<FlowInfo>>;

    async fn get_flows(&self, filter: &FlowFilter) -> Result<Vec<FlowInfo>>;

    async fn get_flows_with_record_count(&self, filter: &FlowFilter) -> Result<FlowRecord>;

    async fn get_flow_names(&self, filter: &FlowFilter) -> Result<Vec<String>>;

    async fn get_app_versions(&self, filter: &FlowFilter) -> Result<Vec<String>>;

    async fn get_app_state(&self, user_id: &str, app_name: &str) -> Result<Option<AppState>>;

    async fn save_app_state(&self, state: &AppState) -> Result<()>;

    /// Remove an instance together with its steps and snapshots.
    async fn delete_flow(&self, flow_id: &str) -> Result<()>;

    /// Remove every step with id `>= from_step_id`.
    async fn delete_steps(&self, flow_id: &str, from_step_id: i64) -> Result<()>;

    /// Number of writes the backend can absorb concurrently.
    fn max_concurrency(&self) -> usize;

    /// Backend name for logs.
    fn name(&self) -> &'static str;

    async fn get_failed_flows(&self, filter: &FlowFilter) -> Result<Vec<FlowInfo>> {
        self.get_flows(&filter.clone().with_status(Status::Failed))
            .await
    }

    async fn get_completed_flows(&self, filter: &FlowFilter) -> Result<Vec<FlowInfo>> {
        self.get_flows(&filter.clone().with_status(Status::Completed))
            .await
    }

    /// Stored snapshot, or the step log folded into one.
    async fn get_snapshot(&self, flow_id: &str) -> Result<Option<Snapshot>> {
        if let Some(snapshot) = self.load_snapshot(flow_id).await? {
            return Ok(Some(snapshot));
        }
        let steps = self.get_steps(flow_id).await?;
        if steps.is_empty() {
            return Ok(None);
        }
        Ok(Some(Snapshot::from_steps(flow_id, &steps)))
    }

    /// State of the instance right after step `step_id`.
    async fn get_snapshot_at(&self, flow_id: &str, step_id: i64) -> Result<Option<Snapshot>> {
        let steps = self.get_steps(flow_id).await?;
        let Some(last) = steps.last() else {
            return Ok(None);
        };
        if step_id < 0 || step_id > last.id {
            return Err(StoreError::validation(format!(
                "step {} is outside the log of flow {} (last step {})",
                step_id, flow_id, last.id
            )));
        }
        let upto: Vec<Step> = steps.into_iter().filter(|s| s.id <= step_id).collect();
        Ok(Some(Snapshot::from_steps(flow_id, &upto)))
    }

    /// Every step of the instance reconciled into task views.
    async fn get_steps_as_tasks(&self, flow_id: &str) -> Result<Vec<Vec<Task>>> {
        let reconciler = TaskReconciler::new();
        let steps = self.get_steps(flow_id).await?;
        let mut out = Vec::with_capacity(steps.len());
        for step in &steps {
            out.push(reconciler.reconcile(step)?);
        }
        Ok(out)
    }

    /// One summary row per step (step 0 excluded) with call-subflow pairs merged.
    async fn get_steps_status(&self, flow_id: &str) -> Result<Vec<StepStatus>> {
        let steps = self.get_steps(flow_id).await?;
        let mut rows = Vec::with_capacity(steps.len());
        for step in steps.iter().filter(|s| s.id != 0) {
            rows.push(reconcile::step_summary(step)?);
        }
        Ok(reconcile::merge_waiting(rows))
    }

    /// Tasks of one step, optionally narrowed to one task name. A call-subflow
    /// step still waiting is replaced by its enclosing completion step.
    async fn get_task_detail(
        &self,
        flow_id: &str,
        step_id: i64,
        task_name: Option<&str>,
    ) -> Result<Vec<Task>> {
        let steps = self.get_steps(flow_id).await?;
        let reconciler = TaskReconciler::new();

        let Some(step) = steps.iter().find(|s| s.id == step_id) else {
            return Err(StoreError::NotFound(format!(
                "step {} of flow {}",
                step_id, flow_id
            )));
        };
        let tasks = reconciler.reconcile(step)?;
        if let Some(name) = task_name
            && !tasks.iter().any(|t| t.id == name)
        {
            return Err(StoreError::NotFound(format!(
                "task {} at step {} of flow {}",
                name, step_id, flow_id
            )));
        }

        let waiting_call = tasks.len() == 2 && tasks[0].status == Some(Status::Waiting);
        if !waiting_call {
            return Ok(tasks);
        }

        let (name, slot) = (tasks[0].id.clone(), tasks[0].subflow_id);
        for later in steps.iter().filter(|s| s.id > step_id) {
            let summary = reconcile::step_summary(later)?;
            if summary.task_name == name
                && summary.subflow_id == slot
                && summary.status != Status::Waiting.as_str()
            {
                let mut enclosing = reconciler.reconcile(later)?;
                if let Some(first) = enclosing.first_mut() {
                    first.step_id = step_id;
                }
                return Ok(enclosing);
            }
        }
        Ok(tasks)
    }
}

/// Closed set of backends, picked once from configuration.
#[derive(Debug, Clone)]
pub enum Backend {
    Memory,
    Relational(RelationalSettings),
}

impl Backend {
    pub async fn open(&self) -> Result<Arc<dyn Store>> {
        match self {
            Backend::Memory => {
                info!("Using in-memory state store");
                Ok(Arc::new(MemoryStore::new()))
            }
            Backend::Relational(settings) => {
                let store = RelationalStore::connect(settings).await?;
                let details = store.details().await;
                info!(
                    schema = %details.schema_version,
                    tables_exist = details.tables_exist,
                    "Using relational state store"
                );
                Ok(Arc::new(store))
            }
        }
    }
}
