//! Statement templates. Parameters use the `?name` form understood by the
//! query rewriter.

pub const CREATE_FLOWSTATE: &str = "create table if not exists flowstate (
    flowinstanceid text primary key,
    userid text,
    appname text,
    appversion text,
    flowname text,
    hostid text,
    flowinput text,
    flowoutput text,
    reruncount bigint default 0,
    rerunofflowinstanceid text,
    starttime text,
    endtime text,
    status text,
    executiontime bigint
)";

pub const CREATE_STEPS: &str = "create table if not exists steps (
    flowinstanceid text not null,
    stepid bigint not null,
    taskname text,
    status text,
    starttime text,
    endtime text,
    stepdata text,
    subflowid bigint,
    flowname text,
    rerun boolean default false,
    primary key (flowinstanceid, stepid)
)";

pub const CREATE_APPSTATE: &str = "create table if not exists appstate (
    userid text not null,
    appname text not null,
    persistenceenabled boolean default false,
    primary key (userid, appname)
)";

pub const PG_COUNT_TABLES: &str = "select count(*) as count from information_schema.tables \
    where table_schema = current_schema() and table_name in ('flowstate', 'appstate', 'steps')";

pub const PG_COUNT_FLOWINPUT: &str = "select count(*) as count from information_schema.columns \
    where table_schema = current_schema() and table_name = 'flowstate' and column_name = 'flowinput'";

pub const SQLITE_COUNT_TABLES: &str = "select count(*) as count from sqlite_master \
    where type = 'table' and name in ('flowstate', 'appstate', 'steps')";

pub const SQLITE_COUNT_FLOWINPUT: &str =
    "select count(*) as count from pragma_table_info('flowstate') where name = 'flowinput'";

pub const UPSERT_STEP: &str = "insert into steps
    (flowinstanceid, stepid, taskname, status, starttime, endtime, stepdata, subflowid, flowname, rerun)
    values (?flowInstanceId, ?stepId, ?taskName, ?status, ?startTime, ?endTime, ?stepData, ?subflowId, ?flowName, ?rerun)
    on conflict (flowinstanceid, stepid) do update set
    taskname = excluded.taskname, status = excluded.status, starttime = excluded.starttime,
    endtime = excluded.endtime, stepdata = excluded.stepdata, subflowid = excluded.subflowid,
    flowname = excluded.flowname, rerun = excluded.rerun";

pub const SELECT_STEPS: &str =
    "select stepdata from steps where flowinstanceid = ?flowId order by stepid";

pub const SELECT_STEPS_DESC: &str =
    "select stepdata from steps where flowinstanceid = ?flowId order by stepid desc";

pub const SELECT_STEP_SUMMARIES: &str = "select stepid, taskname, status, starttime, flowname, rerun, subflowid \
    from steps where flowinstanceid = ?flowId and stepid <> 0 order by stepid";

pub const DELETE_STEPS_FROM: &str =
    "delete from steps where flowinstanceid = ?flowId and stepid >= ?stepId";

pub const DELETE_ALL_STEPS: &str = "delete from steps where flowinstanceid = ?flowId";

pub const DELETE_FLOW: &str = "delete from flowstate where flowinstanceid = ?flowId";

pub const RECORD_START_V1: &str = "insert into flowstate
    (flowinstanceid, userid, appname, appversion, flowname, hostid, rerunofflowinstanceid, starttime, endtime, status)
    values (?flowInstanceId, ?userId, ?appName, ?appVersion, ?flowName, ?hostId, ?originalInstanceId, ?startTime, ?endTime, ?status)
    on conflict (flowinstanceid) do update set
    userid = excluded.userid, appname = excluded.appname, appversion = excluded.appversion,
    flowname = excluded.flowname, hostid = excluded.hostid,
    rerunofflowinstanceid = excluded.rerunofflowinstanceid, starttime = excluded.starttime,
    endtime = excluded.endtime, status = excluded.status";

pub const RECORD_START_V2: &str = "insert into flowstate
    (flowinstanceid, userid, appname, appversion, flowname, hostid, flowinput, reruncount, rerunofflowinstanceid, starttime, endtime, status)
    values (?flowInstanceId, ?userId, ?appName, ?appVersion, ?flowName, ?hostId, ?flowInput, ?rerunCount, ?originalInstanceId, ?startTime, ?endTime, ?status)
    on conflict (flowinstanceid) do update set
    userid = excluded.userid, appname = excluded.appname, appversion = excluded.appversion,
    flowname = excluded.flowname, hostid = excluded.hostid, flowinput = excluded.flowinput,
    reruncount = excluded.reruncount, rerunofflowinstanceid = excluded.rerunofflowinstanceid,
    starttime = excluded.starttime, endtime = excluded.endtime, status = excluded.status";

pub const RECORD_END_V1: &str = "update flowstate set endtime = ?endTime, status = ?status, \
    executiontime = cast(?executionTime as bigint) where flowinstanceid = ?flowInstanceId";

pub const RECORD_END_V2: &str = "update flowstate set endtime = ?endTime, status = ?status, \
    executiontime = cast(?executionTime as bigint), flowoutput = ?flowOutput where flowinstanceid = ?flowInstanceId";

pub const SELECT_START_TIME: &str =
    "select starttime from flowstate where flowinstanceid = ?flowInstanceId";

pub const FLOW_COLUMNS_V1: &str = "flowinstanceid, userid, appname, appversion, flowname, hostid, \
    starttime, endtime, executiontime, status, rerunofflowinstanceid";

pub const FLOW_COLUMNS_V2: &str = "flowinstanceid, userid, appname, appversion, flowname, hostid, \
    starttime, endtime, executiontime, status, rerunofflowinstanceid, reruncount, flowinput, flowoutput";

pub const SELECT_APP_STATE: &str = "select userid, appname, persistenceenabled from appstate \
    where userid = ?userId and appname = ?appName";

pub const UPSERT_APP_STATE: &str = "insert into appstate (userid, appname, persistenceenabled) \
    values (?userId, ?appName, ?persistenceEnabled) \
    on conflict (userid, appname) do update set persistenceenabled = excluded.persistenceenabled";
