use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Attrs, ChangeType, FlowChange, Step, flow_code, is_sentinel};

/// Materialized state of a flow instance at one point of its step log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Flow instance id.
    pub id: String,
    /// Id of the last step folded into this snapshot.
    pub snapshot_id: i64,
    pub flow: FlowSnapshot,
    #[serde(default)]
    pub work_queue: BTreeMap<i64, WorkItem>,
    /// Nested flows still running, keyed by subflow slot.
    #[serde(default)]
    pub subflows: BTreeMap<i32, FlowSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSnapshot {
    #[serde(rename = "flowURI", default)]
    pub flow_uri: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskSnapshot>,
    #[serde(default)]
    pub links: BTreeMap<i32, LinkSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub status: i32,
    #[serde(default)]
    pub input: Attrs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub status: i32,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub subflow_id: i32,
    pub task_id: String,
}

impl Snapshot {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            id: flow_id.into(),
            snapshot_id: -1,
            ..Default::default()
        }
    }

    /// Fold an ordered step log into a snapshot.
    pub fn from_steps(flow_id: &str, steps: &[Step]) -> Self {
        let mut snapshot = Self::new(flow_id);
        for step in steps {
            snapshot.apply(step);
        }
        snapshot
    }

    pub fn status(&self) -> i32 {
        self.flow.status
    }

    pub fn apply(&mut self, step: &Step) {
        for (&slot, change) in &step.flow_changes {
            if slot == 0 {
                self.flow.apply(change);
                continue;
            }

            if change.new_flow {
                self.subflows.insert(slot, FlowSnapshot::default());
            }
            let subflow = self.subflows.entry(slot).or_default();
            subflow.apply(change);
            if flow_code::is_terminal(subflow.status) {
                self.subflows.remove(&slot);
            }
        }

        for (&item_id, change) in &step.queue_changes {
            match change.change {
                ChangeType::Delete => {
                    self.work_queue.remove(&item_id);
                }
                _ => {
                    self.work_queue.insert(
                        item_id,
                        WorkItem {
                            subflow_id: change.subflow_id,
                            task_id: change.task_id.clone(),
                        },
                    );
                }
            }
        }

        self.snapshot_id = step.id;
    }
}

impl FlowSnapshot {
    fn apply(&mut self, change: &FlowChange) {
        if !change.flow_uri.is_empty() {
            self.flow_uri = change.flow_uri.clone();
        }
        if !is_sentinel(change.status) {
            self.status = change.status;
        }
        if !change.task_id.is_empty() {
            self.task_id = change.task_id.clone();
        }
        self.attrs
            .extend(change.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

        for (task_id, tc) in &change.tasks {
            if tc.change == ChangeType::Delete {
                self.tasks.remove(task_id);
                continue;
            }
            let task = self.tasks.entry(task_id.clone()).or_default();
            task.status = tc.status;
            if !tc.input.is_empty() {
                task.input = tc.input.clone();
            }
        }

        for (&link_id, lc) in &change.links {
            if lc.change == ChangeType::Delete {
                self.links.remove(&link_id);
                continue;
            }
            let link = self.links.entry(link_id).or_default();
            link.status = lc.status;
            if !lc.from.is_empty() {
                link.from = lc.from.clone();
            }
            if !lc.to.is_empty() {
                link.to = lc.to.clone();
            }
        }
    }
}
