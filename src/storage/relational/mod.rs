pub mod connection;
pub mod settings;
pub mod statements;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::query::NamedArgs;
use crate::reconcile;
use crate::state::*;
use crate::storage::Store;

pub use connection::{
    ConnectionManager, DbDetails, Dialect, Record, RetryPolicy, SchemaVersion, SqlExecutor,
    SqlFailure, is_transient,
};
pub use settings::{RelationalSettings, parse_duration};

/// Store backed by the `flowstate`, `steps` and `appstate` tables.
///
/// Snapshots are not persisted: `get_snapshot` always folds the step log.
pub struct RelationalStore {
    conn: ConnectionManager,
}

fn timestamp(t: Option<DateTime<Utc>>) -> Value {
    match t {
        Some(t) => Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => Value::Null,
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(BASE64.encode(serde_json::to_vec(value)?))
}

fn decode_attrs(record: &Record, column: &str) -> Result<Attrs> {
    let text = record.text(column)?;
    if text.is_empty() {
        return Ok(Attrs::new());
    }
    let raw = BASE64
        .decode(text.as_bytes())
        .map_err(|_| StoreError::unexpected_shape(column, "base64 JSON"))?;
    Ok(serde_json::from_slice(&raw)?)
}

fn decode_step(record: &Record) -> Result<Step> {
    let text = record.text("stepdata")?;
    let raw = BASE64
        .decode(text.as_bytes())
        .map_err(|_| StoreError::unexpected_shape("stepdata", "base64 JSON"))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Append ` where ...` for every set filter field.
fn filter_clause(filter: &FlowFilter, args: &mut NamedArgs) -> String {
    let mut clauses: Vec<String> = Vec::new();
    let fields = [
        ("userid", "userId", &filter.user_id),
        ("appname", "appName", &filter.app_name),
        ("appversion", "appVersion", &filter.app_version),
        ("hostid", "hostId", &filter.host_id),
        ("flowname", "flowName", &filter.flow_name),
        ("status", "status", &filter.status),
    ];
    for (column, param, value) in fields {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            clauses.push(format!("{} = ?{}", column, param));
            args.set(param, value);
        }
    }
    if let Some(id) = filter.flow_instance_id.as_deref().filter(|v| !v.is_empty()) {
        clauses.push(
            "(flowinstanceid = ?instanceId or rerunofflowinstanceid = ?instanceId)".to_string(),
        );
        args.set("instanceId", id);
    }
    if let Some(after) = filter.started_after {
        clauses.push("starttime >= ?startedAfter".to_string());
        args.set("startedAfter", timestamp(Some(after)));
    }
    if let Some(before) = filter.started_before {
        clauses.push("starttime < ?startedBefore".to_string());
        args.set("startedBefore", timestamp(Some(before)));
    }

    if clauses.is_empty() {
        String::new()
    } else {
        format!(" where {}", clauses.join(" and "))
    }
}

impl RelationalStore {
    pub async fn connect(settings: &RelationalSettings) -> Result<Self> {
        let conn = ConnectionManager::connect(settings).await?;
        Ok(Self::with_manager(conn))
    }

    pub fn with_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    pub async fn details(&self) -> DbDetails {
        self.conn.details().await
    }

    /// Create the three tables if missing and re-probe the schema.
    pub async fn init_schema(&self) -> Result<()> {
        for ddl in [
            statements::CREATE_FLOWSTATE,
            statements::CREATE_STEPS,
            statements::CREATE_APPSTATE,
        ] {
            self.conn.exec(ddl, &NamedArgs::new()).await?;
        }
        info!("Schema initialized");
        self.conn.probe_schema().await
    }

    async fn flow_columns(&self) -> (SchemaVersion, &'static str) {
        match self.conn.schema_version().await {
            SchemaVersion::V1 => (SchemaVersion::V1, statements::FLOW_COLUMNS_V1),
            SchemaVersion::V2 => (SchemaVersion::V2, statements::FLOW_COLUMNS_V2),
        }
    }

    fn page_clause(&self, filter: &FlowFilter, args: &mut NamedArgs) -> String {
        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                args.set("limit", limit.max(0));
                args.set("offset", offset.unwrap_or(0).max(0));
                " limit ?limit offset ?offset".to_string()
            }
            (None, Some(offset)) => {
                args.set("offset", offset.max(0));
                match self.conn.dialect() {
                    Dialect::Sqlite => " limit -1 offset ?offset".to_string(),
                    Dialect::Postgres => " offset ?offset".to_string(),
                }
            }
            (None, None) => String::new(),
        }
    }

    fn to_info(record: &Record, version: SchemaVersion) -> Result<FlowInfo> {
        let flow_name = record.text("flowname")?;
        let original = record.text("rerunofflowinstanceid")?;
        let mut info = FlowInfo {
            id: record.text("flowinstanceid")?,
            flow_uri: format!("res://flow:{}", flow_name),
            flow_name,
            status: record.text("status")?,
            status_code: None,
            user_id: record.text("userid")?,
            app_name: record.text("appname")?,
            app_version: record.text("appversion")?,
            host_id: record.text("hostid")?,
            start_time: record.time("starttime")?,
            end_time: record.time("endtime")?,
            execution_time: record.opt_int("executiontime")?,
            original_instance_id: (!original.is_empty()).then_some(original),
            ..Default::default()
        };
        if version == SchemaVersion::V2 {
            info.rerun_count = record.int("reruncount")? as i32;
            info.flow_inputs = decode_attrs(record, "flowinput")?;
            info.flow_outputs = decode_attrs(record, "flowoutput")?;
        }
        Ok(info)
    }

    async fn select_flows(&self, filter: &FlowFilter) -> Result<Vec<FlowInfo>> {
        let (version, columns) = self.flow_columns().await;
        let mut args = NamedArgs::new();
        let clause = filter_clause(filter, &mut args);
        let page = self.page_clause(filter, &mut args);
        let sql = format!(
            "select {} from flowstate{} order by starttime desc, flowinstanceid{}",
            columns, clause, page
        );
        let rows = self.conn.query(&sql, &args).await?;
        rows.iter().map(|r| Self::to_info(r, version)).collect()
    }

    async fn distinct(&self, column: &str, filter: &FlowFilter) -> Result<Vec<String>> {
        let mut args = NamedArgs::new();
        let clause = filter_clause(&filter.unpaged(), &mut args);
        let sql = format!(
            "select distinct {col} as entry from flowstate{clause} order by entry",
            col = column,
            clause = clause
        );
        let rows = self.conn.query(&sql, &args).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let value = row.text("entry")?;
            if !value.is_empty() {
                out.push(value);
            }
        }
        Ok(out)
    }
}

/// Summary columns for a step row. A step the reconciler rejects is still
/// stored; its row falls back to the lowest slot's task and flow name.
fn summary_columns(step: &Step) -> StepStatus {
    match reconcile::step_summary(step) {
        Ok(summary) => summary,
        Err(e) => {
            warn!(flow_id = %step.flow_id, step_id = step.id, error = %e, "Storing step without a task summary");
            let lowest = step.flow_changes.values().next();
            StepStatus {
                step_id: step.id,
                task_name: lowest.map(|c| c.task_id.clone()).unwrap_or_default(),
                status: String::new(),
                start_time: step.start_time,
                flow_name: lowest.map(|c| c.flow_name().to_string()).unwrap_or_default(),
                rerun: step.rerun,
                subflow_id: 0,
            }
        }
    }
}

#[async_trait]
impl Store for RelationalStore {
    async fn save_step(&self, step: &Step) -> Result<()> {
        if step.flow_id.is_empty() {
            return Err(StoreError::validation("step is missing a flow instance id"));
        }
        let summary = summary_columns(step);

        let args = NamedArgs::new()
            .with("flowInstanceId", step.flow_id.as_str())
            .with("stepId", step.id)
            .with("taskName", summary.task_name)
            .with("status", summary.status)
            .with("startTime", timestamp(step.start_time))
            .with("endTime", timestamp(step.end_time))
            .with("stepData", encode_json(step)?)
            .with("subflowId", summary.subflow_id)
            .with("flowName", summary.flow_name)
            .with("rerun", step.rerun);
        self.conn.exec(statements::UPSERT_STEP, &args).await?;
        debug!(flow_id = %step.flow_id, step_id = step.id, "Saved step");
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        debug!(
            flow_id = %snapshot.id,
            snapshot_id = snapshot.snapshot_id,
            "Snapshot not persisted, relational reads fold the step log"
        );
        Ok(())
    }

    async fn record_start(&self, state: &FlowState) -> Result<()> {
        if state.flow_instance_id.is_empty() {
            return Err(StoreError::validation("flow state is missing a flow instance id"));
        }
        let mut args = NamedArgs::new()
            .with("flowInstanceId", state.flow_instance_id.as_str())
            .with("userId", state.user_id.as_str())
            .with("appName", state.app_name.as_str())
            .with("appVersion", state.app_version.as_str())
            .with("flowName", state.flow_name.as_str())
            .with("hostId", state.host_id.as_str())
            .with("originalInstanceId", state.original_instance_id.as_str())
            .with("startTime", timestamp(state.start_time))
            .with("endTime", timestamp(state.end_time))
            .with("status", state.status.as_str());

        let template = match self.conn.schema_version().await {
            SchemaVersion::V1 => statements::RECORD_START_V1,
            SchemaVersion::V2 => {
                args.set("flowInput", encode_json(&state.flow_inputs)?);
                args.set("rerunCount", state.rerun_count);
                statements::RECORD_START_V2
            }
        };
        self.conn.exec(template, &args).await?;
        info!(flow_id = %state.flow_instance_id, "Recorded flow start");
        Ok(())
    }

    async fn record_end(&self, state: &FlowState) -> Result<()> {
        if state.flow_instance_id.is_empty() {
            return Err(StoreError::validation("flow state is missing a flow instance id"));
        }

        let start = match state.start_time {
            Some(t) => Some(t),
            None => {
                let args =
                    NamedArgs::new().with("flowInstanceId", state.flow_instance_id.as_str());
                let rows = self.conn.query(statements::SELECT_START_TIME, &args).await?;
                match rows.first() {
                    Some(row) => row.time("starttime")?,
                    None => None,
                }
            }
        };

        let mut args = NamedArgs::new()
            .with("flowInstanceId", state.flow_instance_id.as_str())
            .with("endTime", timestamp(state.end_time))
            .with("status", state.status.as_str())
            .with(
                "executionTime",
                execution_millis(start, state.end_time).map_or(Value::Null, Value::from),
            );
        let template = match self.conn.schema_version().await {
            SchemaVersion::V1 => statements::RECORD_END_V1,
            SchemaVersion::V2 => {
                args.set("flowOutput", encode_json(&state.flow_outputs)?);
                statements::RECORD_END_V2
            }
        };

        let updated = self.conn.exec(template, &args).await?;
        if updated == 0 {
            // End reported without a start: keep what we know.
            debug!(flow_id = %state.flow_instance_id, "No start record, inserting on end");
            self.record_start(state).await?;
            self.conn.exec(template, &args).await?;
        }
        info!(flow_id = %state.flow_instance_id, status = %state.status, "Recorded flow end");
        Ok(())
    }

    async fn get_steps(&self, flow_id: &str) -> Result<Vec<Step>> {
        let args = NamedArgs::new().with("flowId", flow_id);
        let rows = self.conn.query(statements::SELECT_STEPS, &args).await?;
        rows.iter().map(decode_step).collect()
    }

    async fn load_snapshot(&self, _flow_id: &str) -> Result<Option<Snapshot>> {
        Ok(None)
    }

    async fn get_status(&self, flow_id: &str) -> Result<Option<i32>> {
        let args = NamedArgs::new().with("flowId", flow_id);
        let rows = self.conn.query(statements::SELECT_STEPS_DESC, &args).await?;
        for row in &rows {
            let step = decode_step(row)?;
            if let Some(root) = step.root_change()
                && !is_sentinel(root.status)
            {
                return Ok(Some(root.status));
            }
        }
        Ok(None)
    }

    async fn get_flow(&self, flow_id: &str, filter: &FlowFilter) -> Result<Option<FlowInfo>> {
        let filter = FlowFilter {
            flow_instance_id: None,
            ..filter.unpaged()
        };
        let (version, columns) = self.flow_columns().await;
        let mut args = NamedArgs::new();
        let clause = filter_clause(&filter, &mut args);
        args.set("flowId", flow_id);
        let sql = if clause.is_empty() {
            format!("select {} from flowstate where flowinstanceid = ?flowId", columns)
        } else {
            format!(
                "select {} from flowstate{} and flowinstanceid = ?flowId",
                columns, clause
            )
        };
        let rows = self.conn.query(&sql, &args).await?;
        match rows.first() {
            Some(row) => {
                let mut info = Self::to_info(row, version)?;
                info.status_code = self.get_status(flow_id).await?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    async fn get_flows(&self, filter: &FlowFilter) -> Result<Vec<FlowInfo>> {
        self.select_flows(filter).await
    }

    async fn get_flows_with_record_count(&self, filter: &FlowFilter) -> Result<FlowRecord> {
        let mut args = NamedArgs::new();
        let clause = filter_clause(filter, &mut args);
        let sql = format!("select count(*) as full_count from flowstate{}", clause);
        let rows = self.conn.query(&sql, &args).await?;
        let count = match rows.first() {
            Some(row) => row.int("full_count")?,
            None => 0,
        };
        Ok(FlowRecord {
            count,
            flow_data: self.select_flows(filter).await?,
        })
    }

    async fn get_flow_names(&self, filter: &FlowFilter) -> Result<Vec<String>> {
        self.distinct("flowname", filter).await
    }

    async fn get_app_versions(&self, filter: &FlowFilter) -> Result<Vec<String>> {
        self.distinct("appversion", filter).await
    }

    async fn get_app_state(&self, user_id: &str, app_name: &str) -> Result<Option<AppState>> {
        let args = NamedArgs::new()
            .with("userId", user_id)
            .with("appName", app_name);
        let rows = self.conn.query(statements::SELECT_APP_STATE, &args).await?;
        match rows.first() {
            Some(row) => Ok(Some(AppState {
                user_id: row.text("userid")?,
                app_name: row.text("appname")?,
                persistence_enabled: row.flag("persistenceenabled")?,
            })),
            None => Ok(None),
        }
    }

    async fn save_app_state(&self, state: &AppState) -> Result<()> {
        if state.app_name.is_empty() {
            return Err(StoreError::validation("app state is missing an app name"));
        }
        let args = NamedArgs::new()
            .with("userId", state.user_id.as_str())
            .with("appName", state.app_name.as_str())
            .with("persistenceEnabled", state.persistence_enabled);
        self.conn.exec(statements::UPSERT_APP_STATE, &args).await?;
        Ok(())
    }

    async fn delete_flow(&self, flow_id: &str) -> Result<()> {
        let args = NamedArgs::new().with("flowId", flow_id);
        self.conn.exec(statements::DELETE_ALL_STEPS, &args).await?;
        self.conn.exec(statements::DELETE_FLOW, &args).await?;
        info!(flow_id = %flow_id, "Deleted flow");
        Ok(())
    }

    async fn delete_steps(&self, flow_id: &str, from_step_id: i64) -> Result<()> {
        let args = NamedArgs::new()
            .with("flowId", flow_id)
            .with("stepId", from_step_id);
        let removed = self.conn.exec(statements::DELETE_STEPS_FROM, &args).await?;
        debug!(flow_id = %flow_id, from_step_id, removed, "Truncated step log");
        Ok(())
    }

    /// Steps-status rows come straight from the summary columns.
    async fn get_steps_status(&self, flow_id: &str) -> Result<Vec<StepStatus>> {
        let args = NamedArgs::new().with("flowId", flow_id);
        let rows = self
            .conn
            .query(statements::SELECT_STEP_SUMMARIES, &args)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(StepStatus {
                step_id: row.int("stepid")?,
                task_name: row.text("taskname")?,
                status: row.text("status")?,
                start_time: row.time("starttime")?,
                flow_name: row.text("flowname")?,
                rerun: row.flag("rerun")?,
                subflow_id: row.int("subflowid")? as i32,
            });
        }
        Ok(reconcile::merge_waiting(out))
    }

    fn max_concurrency(&self) -> usize {
        self.conn.max_concurrency()
    }

    fn name(&self) -> &'static str {
        "relational"
    }
}
