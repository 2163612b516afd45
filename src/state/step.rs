use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Attrs, null_as_default};

/// Kind of change a task, link or work-queue entry went through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ChangeType {
    #[default]
    Add,
    Update,
    Delete,
    Other(i32),
}

impl From<i32> for ChangeType {
    fn from(code: i32) -> Self {
        match code {
            0 => ChangeType::Add,
            1 => ChangeType::Update,
            2 => ChangeType::Delete,
            other => ChangeType::Other(other),
        }
    }
}

impl From<ChangeType> for i32 {
    fn from(change: ChangeType) -> Self {
        match change {
            ChangeType::Add => 0,
            ChangeType::Update => 1,
            ChangeType::Delete => 2,
            ChangeType::Other(code) => code,
        }
    }
}

/// One immutable delta of a flow instance's execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: i64,
    pub flow_id: String,
    /// Subflow slot (0 = root flow) to the change recorded for it.
    #[serde(default, deserialize_with = "null_as_default")]
    pub flow_changes: BTreeMap<i32, FlowChange>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub queue_changes: BTreeMap<i64, QueueChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rerun: bool,
}

impl Step {
    pub fn new(flow_id: impl Into<String>, id: i64) -> Self {
        Self {
            id,
            flow_id: flow_id.into(),
            flow_changes: BTreeMap::new(),
            queue_changes: BTreeMap::new(),
            start_time: None,
            end_time: None,
            rerun: false,
        }
    }

    /// Builder-style helper used by producers and tests.
    pub fn with_change(mut self, slot: i32, change: FlowChange) -> Self {
        self.flow_changes.insert(slot, change);
        self
    }

    /// The change for the root flow, if this step touched it.
    pub fn root_change(&self) -> Option<&FlowChange> {
        self.flow_changes.get(&0)
    }
}

/// The part of a step that concerns one flow (root or nested).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowChange {
    #[serde(default)]
    pub new_flow: bool,
    #[serde(rename = "flowURI", default, deserialize_with = "null_as_default")]
    pub flow_uri: String,
    #[serde(default)]
    pub subflow_id: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub task_id: String,
    #[serde(default = "unchanged_status")]
    pub status: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attrs: Attrs,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tasks: BTreeMap<String, TaskChange>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub links: BTreeMap<i32, LinkChange>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub return_data: Attrs,
}

fn unchanged_status() -> i32 {
    super::STATUS_UNCHANGED
}

impl Default for FlowChange {
    fn default() -> Self {
        Self {
            new_flow: false,
            flow_uri: String::new(),
            subflow_id: 0,
            task_id: String::new(),
            status: super::STATUS_UNCHANGED,
            attrs: Attrs::new(),
            tasks: BTreeMap::new(),
            links: BTreeMap::new(),
            return_data: Attrs::new(),
        }
    }
}

impl FlowChange {
    /// Flow name taken from the URI (`res://flow:name` → `name`).
    pub fn flow_name(&self) -> &str {
        match self.flow_uri.rfind(':') {
            Some(idx) => &self.flow_uri[idx + 1..],
            None => &self.flow_uri,
        }
    }
}

/// Status transition of one task plus the input it saw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskChange {
    #[serde(default)]
    pub change: ChangeType,
    #[serde(default)]
    pub status: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub input: Attrs,
}

/// Status transition of one link between two tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkChange {
    #[serde(default)]
    pub change: ChangeType,
    #[serde(default)]
    pub status: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub from: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub to: String,
}

/// Work-queue mutation recorded alongside a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueChange {
    #[serde(default)]
    pub change: ChangeType,
    #[serde(default)]
    pub subflow_id: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub task_id: String,
}
