use flowstate::ErrorBody;
use flowstate::StoreError;
use flowstate::query::RewriteError;
use flowstate::reconcile::ReconcileError;
use flowstate::state::*;
use serde_json::json;

// ===== Status =====

#[test]
fn task_codes_map_to_labels() {
    let cases = [
        (0, Status::Created),
        (10, Status::Scheduled),
        (20, Status::Started),
        (30, Status::Waiting),
        (40, Status::Completed),
        (50, Status::Skipped),
        (100, Status::Failed),
        (77, Status::Unknown),
    ];
    for (code, status) in cases {
        assert_eq!(Status::from_task_code(code), status, "task code {}", code);
    }
}

#[test]
fn flow_codes_map_to_labels() {
    assert_eq!(Status::from_flow_code(0), Status::Created);
    assert_eq!(Status::from_flow_code(100), Status::Started);
    assert_eq!(Status::from_flow_code(500), Status::Completed);
    assert_eq!(Status::from_flow_code(600), Status::Cancelled);
    assert_eq!(Status::from_flow_code(700), Status::Failed);
    assert_eq!(Status::from_flow_code(-1), Status::Unknown);

    assert!(flow_code::is_terminal(500));
    assert!(flow_code::is_terminal(700));
    assert!(!flow_code::is_terminal(100));
}

#[test]
fn sentinel_statuses() {
    assert!(is_sentinel(STATUS_UNCHANGED));
    assert!(is_sentinel(0));
    assert!(!is_sentinel(100));
}

#[test]
fn status_parse_and_display() {
    assert_eq!("completed".parse::<Status>().unwrap(), Status::Completed);
    assert_eq!("FAILED".parse::<Status>().unwrap(), Status::Failed);
    assert!("bogus".parse::<Status>().is_err());
    assert_eq!(Status::Waiting.to_string(), "Waiting");
    assert_eq!(serde_json::to_value(Status::Cancelled).unwrap(), json!("Cancelled"));
}

// ===== Step payloads =====

#[test]
fn change_types_use_numeric_codes() {
    assert_eq!(serde_json::to_value(ChangeType::Delete).unwrap(), json!(2));
    let parsed: ChangeType = serde_json::from_value(json!(1)).unwrap();
    assert_eq!(parsed, ChangeType::Update);
    let odd: ChangeType = serde_json::from_value(json!(9)).unwrap();
    assert_eq!(odd, ChangeType::Other(9));
    assert_eq!(serde_json::to_value(odd).unwrap(), json!(9));
}

#[test]
fn step_tolerates_nulls_and_missing_fields() {
    let step: Step = serde_json::from_value(json!({
        "id": 3,
        "flowId": "f1",
        "flowChanges": {
            "0": {
                "flowURI": null,
                "taskId": null,
                "attrs": null,
                "tasks": {"A": {"change": 1, "status": 40, "input": null}},
                "links": null,
                "returnData": null
            }
        },
        "queueChanges": null
    }))
    .unwrap();

    assert_eq!(step.id, 3);
    assert!(step.queue_changes.is_empty());
    assert!(!step.rerun);
    assert!(step.start_time.is_none());

    let root = step.root_change().unwrap();
    assert_eq!(root.status, STATUS_UNCHANGED);
    assert!(root.flow_uri.is_empty());
    assert!(root.attrs.is_empty());
    assert_eq!(root.tasks["A"].status, 40);
    assert!(root.tasks["A"].input.is_empty());
}

#[test]
fn step_serializes_with_wire_names() {
    let step = Step::new("f1", 0).with_change(
        0,
        FlowChange {
            new_flow: true,
            flow_uri: "res://flow:orders".to_string(),
            status: 100,
            ..Default::default()
        },
    );
    let value = serde_json::to_value(&step).unwrap();
    assert_eq!(value["flowId"], json!("f1"));
    assert_eq!(value["flowChanges"]["0"]["flowURI"], json!("res://flow:orders"));
    assert_eq!(value["flowChanges"]["0"]["newFlow"], json!(true));
    assert!(value.get("startTime").is_none());
}

#[test]
fn flow_name_comes_from_uri() {
    let change = FlowChange {
        flow_uri: "res://flow:payments".to_string(),
        ..Default::default()
    };
    assert_eq!(change.flow_name(), "payments");
    assert_eq!(FlowChange::default().flow_name(), "");
}

#[test]
fn flow_state_accepts_legacy_status_key() {
    let state: FlowState = serde_json::from_value(json!({
        "flowInstanceId": "f1",
        "flowStats": "Started",
        "userId": null
    }))
    .unwrap();
    assert_eq!(state.status, "Started");
    assert!(state.user_id.is_empty());
}

// ===== Filters =====

#[test]
fn empty_filter_fields_match_anything() {
    let info = FlowInfo {
        id: "f1".to_string(),
        user_id: "u1".to_string(),
        status: "Completed".to_string(),
        ..Default::default()
    };
    let filter = FlowFilter {
        user_id: Some(String::new()),
        status: Some("Completed".to_string()),
        ..Default::default()
    };
    assert!(filter.matches(&info));
    assert!(!FlowFilter::default().with_status(Status::Failed).matches(&info));
}

#[test]
fn pagination_slices() {
    let items: Vec<i32> = (0..10).collect();
    assert_eq!(FlowFilter::default().page(8, 5).paginate(items.clone()), vec![8, 9]);
    assert_eq!(FlowFilter::default().page(2, 0).paginate(items.clone()).len(), 0);
    assert_eq!(FlowFilter::default().paginate(items).len(), 10);
}

// ===== Errors =====

#[test]
fn error_codes() {
    assert_eq!(StoreError::validation("bad").status_code(), 400);
    assert_eq!(StoreError::NotFound("x".into()).status_code(), 404);
    assert_eq!(StoreError::Overloaded(5).status_code(), 503);
    assert_eq!(
        StoreError::from(RewriteError::UnnamedParameter).status_code(),
        400
    );
    assert_eq!(
        StoreError::from(ReconcileError::NoFlowChanges {
            flow_id: "f".into(),
            step_id: 1,
        })
        .status_code(),
        500
    );
}

#[test]
fn error_body_hides_backend_detail_in_headline() {
    let err = StoreError::Backend("relation \"steps\" does not exist".to_string());
    let body = ErrorBody::from(&err);
    assert_eq!(body.code, 500);
    assert_eq!(body.error, "Internal backend error");
    assert_eq!(body.details.as_deref(), Some("relation \"steps\" does not exist"));

    let body = ErrorBody::from(&StoreError::validation("flow id is required"));
    let value = serde_json::to_value(&body).unwrap();
    assert_eq!(value["code"], json!(400));
    assert!(value["error"].as_str().unwrap().contains("flow id is required"));
    assert!(value.get("details").is_none());
}
