//! Reconstruction of per-task views from step deltas.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{Attrs, FlowChange, Status, Step, StepStatus, task_code};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("step {step_id} of flow {flow_id} has no flow changes")]
    NoFlowChanges { flow_id: String, step_id: i64 },

    /// Steps only ever pair a parent flow with the one subflow it starts or ends.
    #[error("step {step_id} of flow {flow_id} touches {slots} subflow slots, at most 2 are supported")]
    TooManySubflows {
        flow_id: String,
        step_id: i64,
        slots: usize,
    },
}

/// Derived view of one task at one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub step_id: i64,
    pub subflow_id: i32,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub input: Attrs,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub output: Attrs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    pub status: Option<Status>,
    pub flow_status: Status,
    pub start_task: bool,
    pub new_subflow: bool,
    pub flow_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub from: String,
    pub to: String,
    pub from_task_status: Option<Status>,
    pub to_task_status: Option<Status>,
    pub status: String,
}

pub fn link_status_label(code: i32) -> &'static str {
    match code {
        1 => "false",
        2 => "true",
        3 => "skipped",
        _ => "unknown",
    }
}

/// Stateless step-to-task transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskReconciler {
    include_ready_input: bool,
}

impl TaskReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also accept tasks in the ready state when picking a task's input.
    pub fn with_ready_input() -> Self {
        Self {
            include_ready_input: true,
        }
    }

    pub fn reconcile(&self, step: &Step) -> Result<Vec<Task>, ReconcileError> {
        let mut slots = step.flow_changes.iter();
        match step.flow_changes.len() {
            0 => Err(ReconcileError::NoFlowChanges {
                flow_id: step.flow_id.clone(),
                step_id: step.id,
            }),
            1 => {
                let (&slot, change) = slots.next().ok_or_else(|| ReconcileError::NoFlowChanges {
                    flow_id: step.flow_id.clone(),
                    step_id: step.id,
                })?;
                Ok(vec![self.to_task(step.id, slot, change)])
            }
            2 => {
                // BTreeMap iteration is sorted, so the parent slot comes first.
                let (Some((&parent_slot, parent)), Some((&sub_slot, sub))) =
                    (slots.next(), slots.next())
                else {
                    return Err(ReconcileError::NoFlowChanges {
                        flow_id: step.flow_id.clone(),
                        step_id: step.id,
                    });
                };

                let parent_task = self.to_task(step.id, parent_slot, parent);
                let mut subflow_task = self.to_task(step.id, sub_slot, sub);
                subflow_task.new_subflow = sub.new_flow;

                if subflow_task.new_subflow {
                    subflow_task.id.clear();
                    Ok(vec![parent_task, subflow_task])
                } else {
                    Ok(vec![subflow_task, parent_task])
                }
            }
            n => Err(ReconcileError::TooManySubflows {
                flow_id: step.flow_id.clone(),
                step_id: step.id,
                slots: n,
            }),
        }
    }

    fn qualifies(&self, code: i32, ready_allowed: bool) -> bool {
        matches!(code, task_code::WAITING | task_code::DONE | task_code::FAILED)
            || (ready_allowed && self.include_ready_input && code == task_code::READY)
    }

    fn to_task(&self, step_id: i64, slot: i32, change: &FlowChange) -> Task {
        let mut task = Task {
            id: change.task_id.clone(),
            step_id,
            subflow_id: slot,
            output: attrs_to_output(&change.attrs),
            flow_status: Status::from_flow_code(change.status),
            flow_name: change.flow_name().to_string(),
            ..Default::default()
        };

        if change.new_flow {
            task.start_task = true;
            task.status = Some(Status::Started);
            if let Some((id, tc)) = change
                .tasks
                .iter()
                .find(|(_, tc)| self.qualifies(tc.status, true))
            {
                task.id = id.clone();
                task.input = tc.input.clone();
                task.status = Some(Status::from_task_code(tc.status));
            }
            return task;
        }

        if !change.return_data.is_empty() {
            task.input = change.return_data.clone();
        }

        for (id, tc) in &change.tasks {
            // Ready only counts for the task the change is pinned to.
            if !self.qualifies(tc.status, *id == task.id) {
                continue;
            }
            task.id = id.clone();
            if !tc.input.is_empty() {
                task.input = tc.input.clone();
            }
            task.status = Some(Status::from_task_code(tc.status));
        }

        for link in change.links.values() {
            if link.status == 0 && (link.from.is_empty() || link.to.is_empty()) {
                continue;
            }
            if link.from != task.id {
                continue;
            }
            let status_of = |id: &str| {
                change
                    .tasks
                    .get(id)
                    .map(|tc| Status::from_task_code(tc.status))
            };
            task.links.push(Link {
                from: link.from.clone(),
                to: link.to.clone(),
                from_task_status: status_of(&link.from),
                to_task_status: status_of(&link.to),
                status: link_status_label(link.status).to_string(),
            });
        }

        task
    }
}

/// Attribute writes as task output; `_A.<task>.<field>` keys surface as `<field>`.
pub fn attrs_to_output(attrs: &Attrs) -> Attrs {
    attrs
        .iter()
        .map(|(key, value)| {
            let name = match key.strip_prefix("_A.") {
                Some(rest) => match rest.find('.') {
                    Some(idx) if idx > 0 => &rest[idx + 1..],
                    _ => rest,
                },
                None => key.as_str(),
            };
            (name.to_string(), value.clone())
        })
        .collect()
}

/// Summary row for a step, taken from its first reconciled task.
pub fn step_summary(step: &Step) -> Result<StepStatus, ReconcileError> {
    let tasks = TaskReconciler::new().reconcile(step)?;
    let first = tasks.first().ok_or_else(|| ReconcileError::NoFlowChanges {
        flow_id: step.flow_id.clone(),
        step_id: step.id,
    })?;
    Ok(StepStatus {
        step_id: step.id,
        task_name: first.id.clone(),
        status: first.status.map(|s| s.to_string()).unwrap_or_default(),
        start_time: step.start_time,
        flow_name: first.flow_name.clone(),
        rerun: step.rerun,
        subflow_id: first.subflow_id,
    })
}

/// Collapse call-subflow pairs: a `Waiting` row takes the status of the later
/// `Completed`/`Failed` row for the same task and subflow, which is dropped.
pub fn merge_waiting(rows: Vec<StepStatus>) -> Vec<StepStatus> {
    let mut merged: Vec<StepStatus> = Vec::with_capacity(rows.len());
    // Indexes into `merged` of rows still waiting for their closing row.
    let mut waiting: Vec<usize> = Vec::new();

    for row in rows {
        let closes = row.status.eq_ignore_ascii_case("completed")
            || row.status.eq_ignore_ascii_case("failed");
        if closes
            && let Some(pos) = waiting.iter().position(|&i| {
                merged[i].task_name == row.task_name && merged[i].subflow_id == row.subflow_id
            })
        {
            let idx = waiting.remove(pos);
            merged[idx].status = row.status;
            continue;
        }

        if row.status.eq_ignore_ascii_case("waiting") {
            waiting.push(merged.len());
        }
        merged.push(row);
    }
    merged
}
