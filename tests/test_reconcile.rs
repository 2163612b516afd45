use flowstate::reconcile::{
    Link, ReconcileError, TaskReconciler, attrs_to_output, link_status_label, merge_waiting,
    step_summary,
};
use flowstate::state::{Attrs, FlowChange, LinkChange, Status, Step, StepStatus, TaskChange};
use serde_json::json;

fn order_steps() -> Vec<Step> {
    serde_json::from_str(include_str!("fixtures/order_flow_steps.json")).unwrap()
}

fn attrs(value: serde_json::Value) -> Attrs {
    serde_json::from_value(value).unwrap()
}

fn task(status: i32) -> TaskChange {
    TaskChange {
        status,
        ..Default::default()
    }
}

fn status_row(step_id: i64, task: &str, status: &str, subflow_id: i32) -> StepStatus {
    StepStatus {
        step_id,
        task_name: task.to_string(),
        status: status.to_string(),
        subflow_id,
        ..Default::default()
    }
}

#[test]
fn new_flow_step_yields_start_task() {
    let steps = order_steps();
    let tasks = TaskReconciler::new().reconcile(&steps[0]).unwrap();

    assert_eq!(tasks.len(), 1);
    let start = &tasks[0];
    assert_eq!(start.id, "Validate");
    assert_eq!(start.step_id, 0);
    assert!(start.start_task);
    assert_eq!(start.status, Some(Status::Started));
    assert_eq!(start.flow_status, Status::Started);
    assert_eq!(start.flow_name, "orders");
    assert!(start.input.is_empty());
}

#[test]
fn completed_task_carries_input_output_and_links() {
    let steps = order_steps();
    let tasks = TaskReconciler::new().reconcile(&steps[1]).unwrap();

    assert_eq!(tasks.len(), 1);
    let validate = &tasks[0];
    assert_eq!(validate.id, "Validate");
    assert_eq!(validate.status, Some(Status::Completed));
    assert_eq!(validate.input, attrs(json!({"order": {"id": "A-17"}})));
    assert_eq!(validate.output, attrs(json!({"valid": true})));
    assert!(!validate.start_task);

    // The dangling link with no status and no target is left out.
    assert_eq!(
        validate.links,
        vec![Link {
            from: "Validate".to_string(),
            to: "Charge".to_string(),
            from_task_status: Some(Status::Completed),
            to_task_status: Some(Status::Started),
            status: "true".to_string(),
        }]
    );
}

#[test]
fn subflow_start_orders_parent_first() {
    let steps = order_steps();
    let tasks = TaskReconciler::new().reconcile(&steps[2]).unwrap();

    assert_eq!(tasks.len(), 2);
    let (parent, sub) = (&tasks[0], &tasks[1]);

    assert_eq!(parent.id, "Charge");
    assert_eq!(parent.subflow_id, 0);
    assert_eq!(parent.status, Some(Status::Waiting));
    assert_eq!(parent.input, attrs(json!({"amount": 40})));
    assert!(!parent.new_subflow);

    assert_eq!(sub.subflow_id, 1);
    assert!(sub.new_subflow);
    assert!(sub.start_task);
    assert!(sub.id.is_empty());
    assert_eq!(sub.flow_name, "payment");
}

#[test]
fn subflow_end_orders_subflow_first() {
    let steps = order_steps();
    let tasks = TaskReconciler::new().reconcile(&steps[3]).unwrap();

    assert_eq!(tasks.len(), 2);
    let (sub, parent) = (&tasks[0], &tasks[1]);

    assert_eq!(sub.subflow_id, 1);
    assert_eq!(sub.id, "Authorize");
    assert_eq!(sub.status, Some(Status::Completed));
    assert_eq!(sub.flow_status, Status::Completed);
    assert_eq!(sub.output, attrs(json!({"approved": true})));

    assert_eq!(parent.subflow_id, 0);
    assert_eq!(parent.id, "Charge");
    assert_eq!(parent.input, attrs(json!({"receipt": "r-1"})));
    assert_eq!(parent.status, None);
}

#[test]
fn ready_input_is_only_taken_when_requested() {
    let step = Step::new("f-ready", 4).with_change(
        0,
        FlowChange {
            task_id: "Notify".to_string(),
            tasks: [(
                "Notify".to_string(),
                TaskChange {
                    status: 20,
                    input: attrs(json!({"to": "ops"})),
                    ..Default::default()
                },
            )]
            .into(),
            ..Default::default()
        },
    );

    let plain = TaskReconciler::new().reconcile(&step).unwrap();
    assert_eq!(plain[0].id, "Notify");
    assert_eq!(plain[0].status, None);
    assert!(plain[0].input.is_empty());

    let ready = TaskReconciler::with_ready_input().reconcile(&step).unwrap();
    assert_eq!(ready[0].status, Some(Status::Started));
    assert_eq!(ready[0].input, attrs(json!({"to": "ops"})));
}

#[test]
fn ready_task_other_than_pinned_is_ignored() {
    let steps = order_steps();
    // Charge is ready in step 1 but the change is pinned to Validate.
    let tasks = TaskReconciler::with_ready_input().reconcile(&steps[1]).unwrap();
    assert_eq!(tasks[0].id, "Validate");
    assert_eq!(tasks[0].status, Some(Status::Completed));
}

#[test]
fn failed_task_is_reported() {
    let step = Step::new("f-fail", 2).with_change(
        0,
        FlowChange {
            task_id: "Load".to_string(),
            status: 700,
            tasks: [("Load".to_string(), task(100))].into(),
            ..Default::default()
        },
    );
    let tasks = TaskReconciler::new().reconcile(&step).unwrap();
    assert_eq!(tasks[0].status, Some(Status::Failed));
    assert_eq!(tasks[0].flow_status, Status::Failed);
}

#[test]
fn link_with_status_but_empty_endpoint_is_kept() {
    let step = Step::new("f-link", 1).with_change(
        0,
        FlowChange {
            task_id: "A".to_string(),
            tasks: [("A".to_string(), task(40))].into(),
            links: [(
                3,
                LinkChange {
                    status: 3,
                    from: "A".to_string(),
                    ..Default::default()
                },
            )]
            .into(),
            ..Default::default()
        },
    );
    let tasks = TaskReconciler::new().reconcile(&step).unwrap();
    assert_eq!(tasks[0].links.len(), 1);
    assert_eq!(tasks[0].links[0].status, "skipped");
    assert_eq!(tasks[0].links[0].to_task_status, None);
}

#[test]
fn step_without_changes_is_rejected() {
    let step = Step::new("f-empty", 9);
    let err = TaskReconciler::new().reconcile(&step).unwrap_err();
    assert_eq!(
        err,
        ReconcileError::NoFlowChanges {
            flow_id: "f-empty".to_string(),
            step_id: 9,
        }
    );
}

#[test]
fn more_than_two_slots_is_rejected() {
    let step = Step::new("f-wide", 5)
        .with_change(0, FlowChange::default())
        .with_change(1, FlowChange::default())
        .with_change(2, FlowChange::default());
    let err = TaskReconciler::new().reconcile(&step).unwrap_err();
    assert!(matches!(err, ReconcileError::TooManySubflows { slots: 3, .. }));
}

#[test]
fn activity_prefix_is_stripped_from_output() {
    let output = attrs_to_output(&attrs(json!({
        "_A.Fetch.body": "ok",
        "_A.code": 200,
        "plain": 1,
    })));
    assert_eq!(output, attrs(json!({"body": "ok", "code": 200, "plain": 1})));
}

#[test]
fn link_labels() {
    assert_eq!(link_status_label(1), "false");
    assert_eq!(link_status_label(2), "true");
    assert_eq!(link_status_label(3), "skipped");
    assert_eq!(link_status_label(0), "unknown");
}

#[test]
fn summaries_follow_first_task() {
    let steps = order_steps();
    let summaries: Vec<StepStatus> = steps.iter().map(|s| step_summary(s).unwrap()).collect();

    let names: Vec<&str> = summaries.iter().map(|s| s.task_name.as_str()).collect();
    assert_eq!(names, vec!["Validate", "Validate", "Charge", "Authorize", "Charge"]);
    assert_eq!(summaries[2].status, "Waiting");
    assert_eq!(summaries[3].subflow_id, 1);
    assert_eq!(summaries[4].status, "Completed");
    assert_eq!(summaries[0].flow_name, "orders");
    assert!(summaries[0].start_time.is_some());
}

#[test]
fn waiting_row_takes_closing_status() {
    let merged = merge_waiting(vec![
        status_row(1, "Validate", "Completed", 0),
        status_row(2, "Charge", "Waiting", 0),
        status_row(3, "Authorize", "Completed", 1),
        status_row(4, "Charge", "Failed", 0),
        status_row(5, "Report", "Started", 0),
    ]);

    let view: Vec<(i64, &str, &str)> = merged
        .iter()
        .map(|r| (r.step_id, r.task_name.as_str(), r.status.as_str()))
        .collect();
    assert_eq!(
        view,
        vec![
            (1, "Validate", "Completed"),
            (2, "Charge", "Failed"),
            (3, "Authorize", "Completed"),
            (5, "Report", "Started"),
        ]
    );
}

#[test]
fn unmatched_waiting_row_is_kept() {
    let merged = merge_waiting(vec![
        status_row(1, "Call", "Waiting", 0),
        status_row(2, "Call", "Completed", 2),
    ]);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].status, "Waiting");
}
