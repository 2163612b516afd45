//! Reconnect and statement-cache behaviour of the ConnectionManager, driven
//! through a scripted executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flowstate::StoreError;
use flowstate::query::NamedArgs;
use flowstate::storage::relational::{
    ConnectionManager, Dialect, Record, RetryPolicy, SqlExecutor, SqlFailure, is_transient,
};
use serde_json::{Map, Value, json};

/// Fails the first `fail_first` physical calls with `message`, then succeeds.
struct ScriptedExecutor {
    fail_first: usize,
    message: &'static str,
    calls: AtomicUsize,
    executed: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(fail_first: usize, message: &'static str) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            message,
            calls: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
        })
    }

    fn next(&self) -> Result<(), SqlFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            Err(SqlFailure::new(self.message))
        } else {
            Ok(())
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlExecutor for ScriptedExecutor {
    async fn ping(&self) -> Result<(), SqlFailure> {
        self.next()
    }

    async fn fetch(&self, _sql: &str, args: &[Value]) -> Result<Vec<Record>, SqlFailure> {
        self.next()?;
        let mut row = Map::new();
        row.insert("args".to_string(), Value::from(args.len()));
        Ok(vec![Record::new(row)])
    }

    async fn execute(&self, _sql: &str, _args: &[Value]) -> Result<u64, SqlFailure> {
        self.next()?;
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn max_connections(&self) -> usize {
        4
    }
}

fn manager(executor: Arc<ScriptedExecutor>, max_attempts: u32) -> ConnectionManager {
    ConnectionManager::new(
        executor,
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
        },
    )
}

#[tokio::test]
async fn transient_failure_reconnects_and_retries_once() {
    // fetch fails, first ping fails, second ping succeeds, fetch is retried.
    let executor = ScriptedExecutor::new(2, "dial tcp 10.0.0.5:5432: connection refused");
    let conn = manager(executor.clone(), 3);

    let rows = conn
        .query(
            "select * from steps where flowinstanceid = ?flowId",
            &NamedArgs::new().with("flowId", "f1"),
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("args"), Some(&json!(1)));
    assert!(conn.details().await.connected);
}

#[tokio::test]
async fn fatal_failure_is_not_retried() {
    let executor = ScriptedExecutor::new(1, "syntax error at or near \"form\"");
    let conn = manager(executor.clone(), 3);

    let err = conn
        .exec("delete form steps", &NamedArgs::new())
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Backend(_)));
    assert_eq!(err.status_code(), 500);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn exhausted_reconnect_reports_unavailable() {
    let executor = ScriptedExecutor::new(usize::MAX, "i/o timeout");
    let conn = manager(executor.clone(), 2);

    let err = conn
        .exec("delete from steps", &NamedArgs::new())
        .await
        .unwrap_err();

    match &err {
        StoreError::Unavailable { attempts, message } => {
            assert_eq!(*attempts, 2);
            assert!(message.contains("i/o timeout"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.status_code(), 503);
    // One failed statement, one immediate ping, two budgeted pings.
    assert_eq!(executor.calls(), 4);
    assert!(!conn.details().await.connected);
}

#[tokio::test]
async fn zero_budget_still_tries_immediate_ping() {
    let executor = ScriptedExecutor::new(2, "connection reset by peer");
    let conn = manager(executor.clone(), 0);

    let err = conn
        .exec("delete from steps", &NamedArgs::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unavailable { attempts: 0, .. }));
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn start_waits_for_backend() {
    let executor = ScriptedExecutor::new(2, "Connection refused (os error 111)");
    let conn = manager(executor.clone(), 5);
    conn.start().await.unwrap();

    let details = conn.details().await;
    assert!(details.connected);
    // The scripted rows carry no count column, so no tables are seen.
    assert!(!details.tables_exist);
}

#[tokio::test]
async fn start_gives_up_on_fatal_error() {
    let executor = ScriptedExecutor::new(1, "password authentication failed for user \"flow\"");
    let conn = manager(executor.clone(), 5);
    let err = conn.start().await.unwrap_err();
    assert!(matches!(err, StoreError::Backend(_)));
}

#[tokio::test]
async fn statements_are_cached_by_template() {
    let executor = ScriptedExecutor::new(0, "");
    let conn = manager(executor.clone(), 1);
    let template = "update flowstate set status = ?status where flowinstanceid = ?flowId";

    for id in ["a", "b", "c"] {
        conn.exec(
            template,
            &NamedArgs::new().with("status", "Completed").with("flowId", id),
        )
        .await
        .unwrap();
    }
    assert_eq!(conn.cached_statements().await, 1);
    assert_eq!(executor.executed.load(Ordering::SeqCst), 3);

    let first = conn.prepare(template).await.unwrap();
    let second = conn.prepare(template).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn missing_argument_never_reaches_database() {
    let executor = ScriptedExecutor::new(0, "");
    let conn = manager(executor.clone(), 1);

    let err = conn
        .exec("delete from steps where stepid >= ?stepId", &NamedArgs::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Rewrite(_)));
    assert_eq!(err.status_code(), 400);
    assert_eq!(executor.calls(), 0);
}

#[test]
fn classification_of_driver_messages() {
    let transient = [
        "dial tcp: lookup db.internal: no such host",
        "read tcp 10.0.0.1:5432: i/o timeout",
        "connection reset by peer",
        "pool timed out while waiting for an open connection",
        "network is unreachable",
    ];
    for message in transient {
        assert!(is_transient(&SqlFailure::new(message)), "{}", message);
    }

    let fatal = [
        "duplicate key value violates unique constraint",
        "relation \"steps\" does not exist",
        "syntax error at end of input",
    ];
    for message in fatal {
        assert!(!is_transient(&SqlFailure::new(message)), "{}", message);
    }

    let broken = SqlFailure {
        message: "unexpected eof".to_string(),
        bad_connection: true,
    };
    assert!(is_transient(&broken));
}
