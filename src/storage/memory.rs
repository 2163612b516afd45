use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::state::*;
use crate::storage::Store;

/// Everything kept for one flow instance.
#[derive(Debug, Default)]
struct Instance {
    state: Option<FlowState>,
    steps: BTreeMap<i64, Step>,
    snapshots: BTreeMap<i64, Snapshot>,
    /// Root-flow status and URI cached from the step log, each with the id
    /// of the step that set it. Older steps never overwrite newer ones.
    status: Option<i32>,
    status_step: i64,
    flow_uri: String,
    flow_uri_step: i64,
}

impl Instance {
    fn observe(&mut self, step: &Step) {
        let Some(root) = step.root_change() else {
            return;
        };
        if !is_sentinel(root.status) && (self.status.is_none() || step.id >= self.status_step) {
            self.status = Some(root.status);
            self.status_step = step.id;
        }
        if !root.flow_uri.is_empty() && (self.flow_uri.is_empty() || step.id >= self.flow_uri_step) {
            self.flow_uri.clone_from(&root.flow_uri);
            self.flow_uri_step = step.id;
        }
    }

    fn recompute_cache(&mut self) {
        self.status = None;
        self.status_step = 0;
        self.flow_uri.clear();
        self.flow_uri_step = 0;
        let steps = std::mem::take(&mut self.steps);
        for step in steps.values() {
            self.observe(step);
        }
        self.steps = steps;
    }

    fn info(&self, id: &str) -> FlowInfo {
        let mut info = match &self.state {
            Some(state) => FlowInfo::from_state(state),
            None => {
                let flow_name = self
                    .flow_uri
                    .rsplit(':')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                FlowInfo {
                    id: id.to_string(),
                    flow_name,
                    status: self
                        .status
                        .map(Status::from_flow_code)
                        .unwrap_or(Status::Created)
                        .to_string(),
                    start_time: self.steps.values().find_map(|s| s.start_time),
                    ..Default::default()
                }
            }
        };
        if !self.flow_uri.is_empty() {
            info.flow_uri = self.flow_uri.clone();
        }
        info.status_code = self.status;
        info
    }
}

/// Process-local store for tests and development.
///
/// Each instance sits behind its own lock; the outer map lock is only held
/// long enough to find or insert an instance.
#[derive(Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<String, Arc<RwLock<Instance>>>>,
    app_states: RwLock<HashMap<(String, String), AppState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn instance(&self, flow_id: &str) -> Option<Arc<RwLock<Instance>>> {
        self.instances.read().await.get(flow_id).cloned()
    }

    async fn instance_or_create(&self, flow_id: &str) -> Arc<RwLock<Instance>> {
        if let Some(existing) = self.instance(flow_id).await {
            return existing;
        }
        self.instances
            .write()
            .await
            .entry(flow_id.to_string())
            .or_default()
            .clone()
    }

    async fn all_infos(&self, filter: &FlowFilter) -> Vec<FlowInfo> {
        let entries: Vec<(String, Arc<RwLock<Instance>>)> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(id, inst)| (id.clone(), inst.clone()))
            .collect();

        let mut infos = Vec::new();
        for (id, inst) in entries {
            let info = inst.read().await.info(&id);
            if filter.matches(&info) {
                infos.push(info);
            }
        }
        // Newest first, unknown start times last.
        infos.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        infos
    }
}

fn require_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StoreError::validation(format!("{} is missing a flow instance id", kind)));
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_step(&self, step: &Step) -> Result<()> {
        require_id("step", &step.flow_id)?;
        let inst = self.instance_or_create(&step.flow_id).await;
        let mut inst = inst.write().await;
        if inst.steps.insert(step.id, step.clone()).is_some() {
            // A redelivered step may have dropped the status it used to carry.
            inst.recompute_cache();
        } else {
            inst.observe(step);
        }
        debug!(flow_id = %step.flow_id, step_id = step.id, "Saved step");
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        require_id("snapshot", &snapshot.id)?;
        let inst = self.instance_or_create(&snapshot.id).await;
        inst.write()
            .await
            .snapshots
            .insert(snapshot.snapshot_id, snapshot.clone());
        Ok(())
    }

    async fn record_start(&self, state: &FlowState) -> Result<()> {
        require_id("flow state", &state.flow_instance_id)?;
        let inst = self.instance_or_create(&state.flow_instance_id).await;
        inst.write().await.state = Some(state.clone());
        Ok(())
    }

    async fn record_end(&self, state: &FlowState) -> Result<()> {
        require_id("flow state", &state.flow_instance_id)?;
        let inst = self.instance_or_create(&state.flow_instance_id).await;
        let mut inst = inst.write().await;
        match inst.state.as_mut() {
            Some(existing) => {
                existing.end_time = state.end_time;
                existing.status = state.status.clone();
                if !state.flow_outputs.is_empty() {
                    existing.flow_outputs = state.flow_outputs.clone();
                }
            }
            None => inst.state = Some(state.clone()),
        }
        Ok(())
    }

    async fn get_steps(&self, flow_id: &str) -> Result<Vec<Step>> {
        match self.instance(flow_id).await {
            Some(inst) => Ok(inst.read().await.steps.values().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn load_snapshot(&self, flow_id: &str) -> Result<Option<Snapshot>> {
        match self.instance(flow_id).await {
            Some(inst) => Ok(inst.read().await.snapshots.values().next_back().cloned()),
            None => Ok(None),
        }
    }

    async fn get_status(&self, flow_id: &str) -> Result<Option<i32>> {
        match self.instance(flow_id).await {
            Some(inst) => Ok(inst.read().await.status),
            None => Ok(None),
        }
    }

    async fn get_flow(&self, flow_id: &str, filter: &FlowFilter) -> Result<Option<FlowInfo>> {
        let Some(inst) = self.instance(flow_id).await else {
            return Ok(None);
        };
        let info = inst.read().await.info(flow_id);
        let filter = FlowFilter {
            flow_instance_id: None,
            ..filter.unpaged()
        };
        Ok(filter.matches(&info).then_some(info))
    }

    async fn get_flows(&self, filter: &FlowFilter) -> Result<Vec<FlowInfo>> {
        Ok(filter.paginate(self.all_infos(filter).await))
    }

    async fn get_flows_with_record_count(&self, filter: &FlowFilter) -> Result<FlowRecord> {
        let all = self.all_infos(filter).await;
        Ok(FlowRecord {
            count: all.len() as i64,
            flow_data: filter.paginate(all),
        })
    }

    async fn get_flow_names(&self, filter: &FlowFilter) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .all_infos(filter)
            .await
            .into_iter()
            .map(|i| i.flow_name)
            .filter(|n| !n.is_empty())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn get_app_versions(&self, filter: &FlowFilter) -> Result<Vec<String>> {
        let versions: BTreeSet<String> = self
            .all_infos(filter)
            .await
            .into_iter()
            .map(|i| i.app_version)
            .filter(|v| !v.is_empty())
            .collect();
        Ok(versions.into_iter().collect())
    }

    async fn get_app_state(&self, user_id: &str, app_name: &str) -> Result<Option<AppState>> {
        let key = (user_id.to_string(), app_name.to_string());
        Ok(self.app_states.read().await.get(&key).cloned())
    }

    async fn save_app_state(&self, state: &AppState) -> Result<()> {
        if state.app_name.is_empty() {
            return Err(StoreError::validation("app state is missing an app name"));
        }
        let key = (state.user_id.clone(), state.app_name.clone());
        self.app_states.write().await.insert(key, state.clone());
        Ok(())
    }

    async fn delete_flow(&self, flow_id: &str) -> Result<()> {
        self.instances.write().await.remove(flow_id);
        debug!(flow_id = %flow_id, "Deleted flow");
        Ok(())
    }

    async fn delete_steps(&self, flow_id: &str, from_step_id: i64) -> Result<()> {
        let Some(inst) = self.instance(flow_id).await else {
            return Ok(());
        };
        let mut inst = inst.write().await;
        inst.steps.retain(|&id, _| id < from_step_id);
        inst.snapshots.retain(|&id, _| id < from_step_id);
        inst.recompute_cache();
        Ok(())
    }

    fn max_concurrency(&self) -> usize {
        1
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
