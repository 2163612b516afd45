use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Attrs, Status, null_as_default};

/// Instance-level record pushed by the engine on start and end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub flow_instance_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub app_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub app_version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub flow_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub host_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub flow_inputs: Attrs,
    #[serde(default, deserialize_with = "null_as_default")]
    pub flow_outputs: Attrs,
    #[serde(default)]
    pub rerun_count: i32,
    /// Set when this run re-executes an earlier instance.
    #[serde(default, deserialize_with = "null_as_default")]
    pub original_instance_id: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "flowStats", deserialize_with = "null_as_default")]
    pub status: String,
}

/// Read-side view of one flow instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInfo {
    pub id: String,
    pub flow_name: String,
    #[serde(rename = "flowURI")]
    pub flow_uri: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    pub user_id: String,
    pub app_name: String,
    pub app_version: String,
    pub host_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end.
    pub execution_time: Option<i64>,
    pub rerun_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Attrs::is_empty")]
    pub flow_inputs: Attrs,
    #[serde(skip_serializing_if = "Attrs::is_empty")]
    pub flow_outputs: Attrs,
}

impl FlowInfo {
    pub fn from_state(state: &FlowState) -> Self {
        Self {
            id: state.flow_instance_id.clone(),
            flow_name: state.flow_name.clone(),
            flow_uri: format!("res://flow:{}", state.flow_name),
            status: state.status.clone(),
            status_code: None,
            user_id: state.user_id.clone(),
            app_name: state.app_name.clone(),
            app_version: state.app_version.clone(),
            host_id: state.host_id.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            execution_time: execution_millis(state.start_time, state.end_time),
            rerun_count: state.rerun_count,
            original_instance_id: (!state.original_instance_id.is_empty())
                .then(|| state.original_instance_id.clone()),
            flow_inputs: state.flow_inputs.clone(),
            flow_outputs: state.flow_outputs.clone(),
        }
    }
}

pub fn execution_millis(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    match (start, end) {
        (Some(s), Some(e)) => Some((e - s).num_milliseconds()),
        _ => None,
    }
}

/// Filter shared by every flow listing operation. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowFilter {
    pub user_id: Option<String>,
    pub app_name: Option<String>,
    pub app_version: Option<String>,
    pub host_id: Option<String>,
    pub flow_name: Option<String>,
    pub status: Option<String>,
    /// Matches the instance itself or any run that re-executed it.
    pub flow_instance_id: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl FlowFilter {
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn page(mut self, offset: i64, limit: i64) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    /// Same filter with pagination stripped.
    pub fn unpaged(&self) -> Self {
        Self {
            offset: None,
            limit: None,
            ..self.clone()
        }
    }

    pub fn matches(&self, info: &FlowInfo) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w.is_empty() || w == have)
        }

        if !(eq(&self.user_id, &info.user_id)
            && eq(&self.app_name, &info.app_name)
            && eq(&self.app_version, &info.app_version)
            && eq(&self.host_id, &info.host_id)
            && eq(&self.flow_name, &info.flow_name)
            && eq(&self.status, &info.status))
        {
            return false;
        }

        if let Some(id) = self.flow_instance_id.as_deref().filter(|id| !id.is_empty()) {
            let rerun_of = info.original_instance_id.as_deref() == Some(id);
            if info.id != id && !rerun_of {
                return false;
            }
        }

        if let Some(after) = self.started_after
            && info.start_time.is_none_or(|t| t < after)
        {
            return false;
        }
        if let Some(before) = self.started_before
            && info.start_time.is_none_or(|t| t >= before)
        {
            return false;
        }
        true
    }

    /// Apply offset/limit to an already filtered and ordered listing.
    pub fn paginate<T>(&self, items: Vec<T>) -> Vec<T> {
        let offset = self.offset.unwrap_or(0).max(0) as usize;
        let iter = items.into_iter().skip(offset);
        match self.limit {
            Some(limit) => iter.take(limit.max(0) as usize).collect(),
            None => iter.collect(),
        }
    }
}

/// One page of flows plus the total number of matching flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRecord {
    pub count: i64,
    pub flow_data: Vec<FlowInfo>,
}

/// Per-application "persistence enabled" flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub user_id: String,
    pub app_name: String,
    pub persistence_enabled: bool,
}

/// Summary row of one step, as kept in the relational `steps` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    pub step_id: i64,
    pub task_name: String,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub flow_name: String,
    pub rerun: bool,
    pub subflow_id: i32,
}
