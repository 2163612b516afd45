use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Arguments, Column, Row, ValueRef};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::settings::RelationalSettings;
use super::statements;
use crate::error::{Result, StoreError};
use crate::query::{NamedArgs, PreparedTemplate};

static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// A failed call into the database driver.
#[derive(Debug, Clone)]
pub struct SqlFailure {
    pub message: String,
    /// The driver reported the connection itself as unusable.
    pub bad_connection: bool,
}

impl SqlFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            bad_connection: false,
        }
    }
}

impl fmt::Display for SqlFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<sqlx::Error> for SqlFailure {
    fn from(err: sqlx::Error) -> Self {
        let bad_connection = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        );
        Self {
            message: err.to_string(),
            bad_connection,
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "network is unreachable",
    "connection reset by peer",
    "dial tcp: lookup",
    "failed to lookup address",
    "timeout",
    "timedout",
    "timed out",
    "net.error",
    "i/o timeout",
];

/// Network and timeout failures are worth a reconnect; everything else is fatal.
pub fn is_transient(failure: &SqlFailure) -> bool {
    if failure.bad_connection {
        return true;
    }
    let msg = failure.message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| msg.contains(marker))
}

/// One result row as a schema-less column map with typed accessors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(columns: Map<String, Value>) -> Self {
        Self(columns)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column).filter(|v| !v.is_null())
    }

    /// Text column; NULL reads as an empty string.
    pub fn text(&self, column: &str) -> Result<String> {
        match self.get(column) {
            None => Ok(String::new()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Bool(b)) => Ok(b.to_string()),
            Some(_) => Err(StoreError::unexpected_shape(column, "text")),
        }
    }

    pub fn opt_int(&self, column: &str) -> Result<Option<i64>> {
        match self.get(column) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| StoreError::unexpected_shape(column, "integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| StoreError::unexpected_shape(column, "integer")),
            Some(_) => Err(StoreError::unexpected_shape(column, "integer")),
        }
    }

    pub fn int(&self, column: &str) -> Result<i64> {
        Ok(self.opt_int(column)?.unwrap_or_default())
    }

    pub fn flag(&self, column: &str) -> Result<bool> {
        match self.get(column) {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::Number(n)) => Ok(n.as_i64().unwrap_or_default() != 0),
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" | "" => Ok(false),
                _ => Err(StoreError::unexpected_shape(column, "boolean")),
            },
            Some(_) => Err(StoreError::unexpected_shape(column, "boolean")),
        }
    }

    pub fn time(&self, column: &str) -> Result<Option<DateTime<Utc>>> {
        let text = self.text(column)?;
        if text.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| StoreError::unexpected_shape(column, "RFC 3339 timestamp"))
    }
}

/// The raw database surface the connection manager drives.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn ping(&self) -> Result<(), SqlFailure>;

    async fn fetch(&self, sql: &str, args: &[Value]) -> Result<Vec<Record>, SqlFailure>;

    async fn execute(&self, sql: &str, args: &[Value]) -> Result<u64, SqlFailure>;

    fn dialect(&self) -> Dialect;

    fn max_connections(&self) -> usize;
}

/// `SqlExecutor` over an sqlx `Any` pool.
pub struct PoolExecutor {
    pool: AnyPool,
    dialect: Dialect,
    max_open: u32,
}

impl PoolExecutor {
    /// Build the pool without opening a connection yet.
    pub fn connect_lazy(settings: &RelationalSettings) -> Result<Self> {
        install_drivers();

        let url = settings.connection_url()?;
        let limits = settings.pool_limits()?;
        let dialect = if settings.is_sqlite() {
            Dialect::Sqlite
        } else {
            Dialect::Postgres
        };

        let pool = AnyPoolOptions::new()
            .max_connections(limits.max_open)
            .min_connections(limits.max_idle)
            .max_lifetime(limits.max_lifetime)
            .idle_timeout(Duration::from_secs(300))
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(&url)
            .map_err(|e| StoreError::validation(format!("invalid database url: {}", e)))?;

        Ok(Self {
            pool,
            dialect,
            max_open: limits.max_open,
        })
    }
}

fn bind_args(args: &[Value]) -> Result<AnyArguments<'_>, SqlFailure> {
    let mut out = AnyArguments::default();
    for (i, arg) in args.iter().enumerate() {
        let bound = match arg {
            Value::String(s) => out.add(s.as_str()),
            Value::Number(n) => match n.as_i64() {
                Some(int_val) => out.add(int_val),
                None => out.add(n.as_f64().unwrap_or_default()),
            },
            Value::Bool(b) => out.add(*b),
            Value::Null => out.add(None::<String>),
            _ => {
                return Err(SqlFailure::new(format!(
                    "unsupported argument at position {}: arrays/objects cannot be bound",
                    i + 1
                )));
            }
        };
        bound.map_err(|e| SqlFailure::new(format!("failed to bind argument {}: {}", i + 1, e)))?;
    }
    Ok(out)
}

fn row_to_record(row: &AnyRow) -> Result<Record, SqlFailure> {
    let mut map = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Value::Null
        } else if let Ok(v) = row.try_get::<i64, _>(idx) {
            Value::from(v)
        } else if let Ok(v) = row.try_get::<f64, _>(idx) {
            Value::from(v)
        } else if let Ok(v) = row.try_get::<String, _>(idx) {
            Value::String(v)
        } else if let Ok(v) = row.try_get::<bool, _>(idx) {
            Value::Bool(v)
        } else if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
            Value::String(String::from_utf8_lossy(&v).into_owned())
        } else {
            Value::Null
        };
        map.insert(col.name().to_string(), value);
    }
    Ok(Record::new(map))
}

#[async_trait]
impl SqlExecutor for PoolExecutor {
    async fn ping(&self) -> Result<(), SqlFailure> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch(&self, sql: &str, args: &[Value]) -> Result<Vec<Record>, SqlFailure> {
        let rows = sqlx::query_with(sql, bind_args(args)?)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn execute(&self, sql: &str, args: &[Value]) -> Result<u64, SqlFailure> {
        let done = sqlx::query_with(sql, bind_args(args)?)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn max_connections(&self) -> usize {
        self.max_open as usize
    }
}

/// Reconnect budget applied after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Delayed pings after the immediate one, so a reconnect pings at most
    /// `max_attempts + 1` times.
    pub max_attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaVersion {
    /// Without `flowinput`, `flowoutput` and `reruncount`.
    V1,
    #[default]
    V2,
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::V1 => f.write_str("1.0"),
            SchemaVersion::V2 => f.write_str("2.0"),
        }
    }
}

/// What the schema probe found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbDetails {
    pub connected: bool,
    pub tables_exist: bool,
    pub schema_version: SchemaVersion,
    pub message: String,
}

/// Owns the executor, the statement cache and the reconnect policy.
pub struct ConnectionManager {
    executor: Arc<dyn SqlExecutor>,
    retry: RetryPolicy,
    statements: Mutex<HashMap<String, Arc<PreparedTemplate>>>,
    reconnecting: Mutex<()>,
    details: RwLock<DbDetails>,
}

impl ConnectionManager {
    pub fn new(executor: Arc<dyn SqlExecutor>, retry: RetryPolicy) -> Self {
        Self {
            executor,
            retry,
            statements: Mutex::new(HashMap::new()),
            reconnecting: Mutex::new(()),
            details: RwLock::new(DbDetails::default()),
        }
    }

    /// Open the pool from settings, wait for the backend and probe its schema.
    pub async fn connect(settings: &RelationalSettings) -> Result<Self> {
        let retry = settings.retry_policy()?;
        let executor = PoolExecutor::connect_lazy(settings)?;
        let manager = Self::new(Arc::new(executor), retry);
        manager.start().await?;
        Ok(manager)
    }

    /// First contact with the backend: wait out transient failures, then probe.
    pub async fn start(&self) -> Result<()> {
        if let Err(failure) = self.executor.ping().await {
            if !is_transient(&failure) {
                return Err(StoreError::Backend(failure.message));
            }
            warn!(error = %failure, "Database not reachable yet, retrying");
            self.reconnect(&failure).await?;
        } else {
            self.probe_schema().await?;
        }
        Ok(())
    }

    pub fn dialect(&self) -> Dialect {
        self.executor.dialect()
    }

    pub fn max_concurrency(&self) -> usize {
        self.executor.max_connections().max(1)
    }

    pub async fn details(&self) -> DbDetails {
        self.details.read().await.clone()
    }

    pub async fn schema_version(&self) -> SchemaVersion {
        self.details.read().await.schema_version
    }

    pub async fn cached_statements(&self) -> usize {
        self.statements.lock().await.len()
    }

    /// Rewritten statement for a template, rewriting only on a cache miss.
    pub async fn prepare(&self, template: &str) -> Result<Arc<PreparedTemplate>> {
        let mut cache = self.statements.lock().await;
        if let Some(stmt) = cache.get(template) {
            return Ok(stmt.clone());
        }
        let stmt = Arc::new(PreparedTemplate::parse(template)?);
        debug!(sql = %stmt.sql, "Cached statement");
        cache.insert(template.to_string(), stmt.clone());
        Ok(stmt)
    }

    pub async fn query(&self, template: &str, args: &NamedArgs) -> Result<Vec<Record>> {
        let stmt = self.prepare(template).await?;
        let values = stmt.bind(args)?;
        self.with_retry(|| self.executor.fetch(&stmt.sql, &values))
            .await
    }

    pub async fn exec(&self, template: &str, args: &NamedArgs) -> Result<u64> {
        let stmt = self.prepare(template).await?;
        let values = stmt.bind(args)?;
        self.with_retry(|| self.executor.execute(&stmt.sql, &values))
            .await
    }

    pub async fn ping(&self) -> Result<()> {
        self.with_retry(|| self.executor.ping()).await
    }

    /// Run `op`; on a transient failure reconnect and run it exactly once more.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, SqlFailure>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(failure) if is_transient(&failure) => {
                warn!(error = %failure, "Transient database failure, reconnecting");
                self.reconnect(&failure).await?;
                debug!("Retrying operation after reconnect");
                op().await.map_err(|retry_failure| {
                    if is_transient(&retry_failure) {
                        StoreError::Transient(retry_failure.message)
                    } else {
                        StoreError::Backend(retry_failure.message)
                    }
                })
            }
            Err(failure) => Err(StoreError::Backend(failure.message)),
        }
    }

    /// Ping once right away, then up to `max_attempts` more times spaced by
    /// `delay`, until the backend answers.
    async fn reconnect(&self, original: &SqlFailure) -> Result<()> {
        let _guard = self.reconnecting.lock().await;

        let mut last = match self.executor.ping().await {
            Ok(()) => return self.reconnected().await,
            Err(failure) if is_transient(&failure) => failure,
            Err(failure) => return Err(StoreError::Backend(failure.message)),
        };

        for attempt in 1..=self.retry.max_attempts {
            tokio::time::sleep(self.retry.delay).await;
            match self.executor.ping().await {
                Ok(()) => {
                    info!(attempt, "Database connection re-established");
                    return self.reconnected().await;
                }
                Err(failure) if is_transient(&failure) => {
                    warn!(attempt, error = %failure, "Reconnect attempt failed");
                    last = failure;
                }
                Err(failure) => return Err(StoreError::Backend(failure.message)),
            }
        }

        self.details.write().await.connected = false;
        warn!(
            attempts = self.retry.max_attempts,
            last_error = %last,
            "Giving up on database connection"
        );
        Err(StoreError::Unavailable {
            attempts: self.retry.max_attempts,
            message: original.message.clone(),
        })
    }

    async fn reconnected(&self) -> Result<()> {
        self.probe_schema().await
    }

    /// Check for the three tables and the newer `flowinput` column.
    /// Runs against the executor directly so it never re-enters the retry path.
    pub async fn probe_schema(&self) -> Result<()> {
        let (tables_sql, column_sql) = match self.dialect() {
            Dialect::Postgres => (statements::PG_COUNT_TABLES, statements::PG_COUNT_FLOWINPUT),
            Dialect::Sqlite => (
                statements::SQLITE_COUNT_TABLES,
                statements::SQLITE_COUNT_FLOWINPUT,
            ),
        };

        let count = |rows: Vec<Record>| -> Result<i64> {
            match rows.first() {
                Some(row) => row.int("count"),
                None => Ok(0),
            }
        };

        let tables_stmt = self.prepare(tables_sql).await?;
        let tables = self
            .executor
            .fetch(&tables_stmt.sql, &[])
            .await
            .map_err(|f| StoreError::Backend(f.message))?;
        let tables_exist = count(tables)? == 3;

        let column_stmt = self.prepare(column_sql).await?;
        let columns = self
            .executor
            .fetch(&column_stmt.sql, &[])
            .await
            .map_err(|f| StoreError::Backend(f.message))?;
        let has_flowinput = count(columns)? > 0;

        let details = DbDetails {
            connected: true,
            tables_exist,
            schema_version: if tables_exist && !has_flowinput {
                SchemaVersion::V1
            } else {
                SchemaVersion::V2
            },
            message: if tables_exist {
                "connected".to_string()
            } else {
                "required tables flowstate, appstate and steps are missing".to_string()
            },
        };
        info!(
            tables_exist = details.tables_exist,
            schema = %details.schema_version,
            "Probed database schema"
        );
        *self.details.write().await = details;
        Ok(())
    }
}
