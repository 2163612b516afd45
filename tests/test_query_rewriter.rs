use std::collections::HashMap;

use flowstate::query::{NamedArgs, PreparedTemplate, RewriteError, rewrite};
use serde_json::json;

#[test]
fn rewrites_named_parameters_in_order() {
    let args = NamedArgs::new().with("id", "7").with("name", "x");
    let out = rewrite("select * from t where id = ?id and name = ?name", &args).unwrap();

    assert_eq!(out.sql, "select * from t where id = $1 and name = $2;");
    assert_eq!(out.args, vec![json!("7"), json!("x")]);
    assert_eq!(out.names, vec!["id".to_string(), "name".to_string()]);
}

#[test]
fn missing_parameter_is_named_in_error() {
    let err = rewrite("select * from t where id = ?id", &NamedArgs::new()).unwrap_err();
    assert_eq!(err, RewriteError::MissingParameter("id".to_string()));
    assert!(err.to_string().contains("id"));
}

#[test]
fn existing_terminator_is_kept() {
    let args = NamedArgs::new().with("id", 1);
    let out = rewrite("delete from t where id = ?id;", &args).unwrap();
    assert_eq!(out.sql, "delete from t where id = $1;");
}

#[test]
fn parameters_inside_value_lists() {
    let args = NamedArgs::new()
        .with("a", 1)
        .with("b", "two")
        .with("c", true);
    let out = rewrite("insert into t (x, y, z) values (?a, ?b,?c)", &args).unwrap();
    assert_eq!(out.sql, "insert into t (x, y, z) values ($1, $2,$3);");
    assert_eq!(out.args, vec![json!(1), json!("two"), json!(true)]);
}

#[test]
fn repeated_parameter_gets_a_placeholder_per_use() {
    let args = NamedArgs::new().with("id", "f1");
    let out = rewrite(
        "select * from flowstate where (flowinstanceid = ?id or rerunofflowinstanceid = ?id)",
        &args,
    )
    .unwrap();
    assert_eq!(
        out.sql,
        "select * from flowstate where (flowinstanceid = $1 or rerunofflowinstanceid = $2);"
    );
    assert_eq!(out.args, vec![json!("f1"), json!("f1")]);
}

#[test]
fn operators_start_and_end_parameters() {
    let args = NamedArgs::new().with("lo", 3).with("step", 2);
    let out = rewrite("select x from t where a>?lo and b=x+?step*2", &args).unwrap();
    assert_eq!(out.sql, "select x from t where a>$1 and b=x+$2*2;");
}

#[test]
fn quoted_content_passes_through() {
    let args = NamedArgs::new().with("id", 5);
    let out = rewrite(
        "select '?notparam', \"col ?x\", `?y` from t where id = ?id",
        &args,
    )
    .unwrap();
    assert_eq!(
        out.sql,
        "select '?notparam', \"col ?x\", `?y` from t where id = $1;"
    );
    assert_eq!(out.names, vec!["id".to_string()]);
}

#[test]
fn escaped_quote_does_not_close_literal() {
    let args = NamedArgs::new().with("v", "a");
    let out = rewrite(r"select 'it\'s ?v' from t where v = ?v", &args).unwrap();
    assert_eq!(out.sql, r"select 'it\'s ?v' from t where v = $1;");
}

#[test]
fn line_breaks_and_tabs_become_spaces() {
    let args = NamedArgs::new().with("id", 1);
    let out = rewrite("select *\nfrom t\twhere id = ?id\n", &args).unwrap();
    assert_eq!(out.sql, "select * from t where id = $1;");
}

#[test]
fn statement_wrapped_in_quotes_is_rejected() {
    let err = rewrite("'select * from t'", &NamedArgs::new()).unwrap_err();
    assert!(matches!(err, RewriteError::QuotedStatement(_)));

    let err = rewrite("  `select 1`", &NamedArgs::new()).unwrap_err();
    assert!(matches!(err, RewriteError::QuotedStatement(_)));
}

#[test]
fn trailing_quote_is_accepted_once_terminated() {
    // The terminator is appended before the boundary check, so only a
    // leading quote is caught.
    let out = rewrite("select 'a'", &NamedArgs::new()).unwrap();
    assert_eq!(out.sql, "select 'a';");
    assert!(out.args.is_empty());
}

#[test]
fn unnamed_parameter_is_rejected() {
    let err = rewrite("select * from t where id = ? and x = 1", &NamedArgs::new()).unwrap_err();
    assert_eq!(err, RewriteError::UnnamedParameter);
}

#[test]
fn empty_template_is_rejected() {
    assert_eq!(
        rewrite("   \n\t", &NamedArgs::new()).unwrap_err(),
        RewriteError::Empty
    );
}

#[test]
fn question_mark_without_starter_is_literal() {
    let out = rewrite("select a?b from t", &NamedArgs::new()).unwrap();
    assert_eq!(out.sql, "select a?b from t;");
    assert!(out.names.is_empty());
}

#[test]
fn values_bags_are_searched_after_parameters() {
    let mut first = HashMap::new();
    first.insert("name".to_string(), json!("from-bag-1"));
    let mut second = HashMap::new();
    second.insert("name".to_string(), json!("from-bag-2"));
    second.insert("age".to_string(), json!(41));

    let args = NamedArgs {
        parameters: HashMap::from([("id".to_string(), json!(9))]),
        values: vec![first, second],
    };
    let out = rewrite(
        "insert into people (id, name, age) values (?id, ?name, ?age)",
        &args,
    )
    .unwrap();
    assert_eq!(out.args, vec![json!(9), json!("from-bag-1"), json!(41)]);
}

#[test]
fn direct_parameters_shadow_values_bags() {
    let mut bag = HashMap::new();
    bag.insert("id".to_string(), json!("bag"));
    let args = NamedArgs {
        parameters: HashMap::from([("id".to_string(), json!("direct"))]),
        values: vec![bag],
    };
    let out = rewrite("select 1 from t where id = ?id", &args).unwrap();
    assert_eq!(out.args, vec![json!("direct")]);
}

#[test]
fn parsed_template_binds_different_arguments() {
    let prepared = PreparedTemplate::parse("select * from steps where stepid >= ?stepId").unwrap();
    assert_eq!(prepared.sql, "select * from steps where stepid >= $1;");

    let first = prepared.bind(&NamedArgs::new().with("stepId", 3)).unwrap();
    let second = prepared.bind(&NamedArgs::new().with("stepId", 8)).unwrap();
    assert_eq!(first, vec![json!(3)]);
    assert_eq!(second, vec![json!(8)]);
}

#[test]
fn dotted_names_are_allowed() {
    let args = NamedArgs::new().with("flow.id", "x");
    let out = rewrite("select * from t where id = ?flow.id", &args).unwrap();
    assert_eq!(out.sql, "select * from t where id = $1;");
    assert_eq!(out.names, vec!["flow.id".to_string()]);
}
