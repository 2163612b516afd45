use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Task status codes reported by the flow engine.
pub mod task_code {
    pub const NOT_STARTED: i32 = 0;
    pub const ENTERED: i32 = 10;
    pub const READY: i32 = 20;
    pub const WAITING: i32 = 30;
    pub const DONE: i32 = 40;
    pub const SKIPPED: i32 = 50;
    pub const FAILED: i32 = 100;
}

/// Flow status codes reported by the flow engine.
pub mod flow_code {
    pub const NOT_STARTED: i32 = 0;
    pub const ACTIVE: i32 = 100;
    pub const COMPLETED: i32 = 500;
    pub const CANCELLED: i32 = 600;
    pub const FAILED: i32 = 700;

    pub fn is_terminal(code: i32) -> bool {
        matches!(code, COMPLETED | CANCELLED | FAILED)
    }
}

/// Status carried by a FlowChange that leaves the flow status as it was.
pub const STATUS_UNCHANGED: i32 = -1;

/// `-1` and `0` both mean "no new status" in a FlowChange.
pub fn is_sentinel(code: i32) -> bool {
    code == STATUS_UNCHANGED || code == flow_code::NOT_STARTED
}

/// Human-readable status label used by flow records and derived tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Created,
    Scheduled,
    Skipped,
    Started,
    Failed,
    Completed,
    Cancelled,
    Waiting,
    #[default]
    Unknown,
}

impl Status {
    pub fn from_task_code(code: i32) -> Self {
        match code {
            task_code::NOT_STARTED => Status::Created,
            task_code::ENTERED => Status::Scheduled,
            task_code::SKIPPED => Status::Skipped,
            task_code::READY => Status::Started,
            task_code::FAILED => Status::Failed,
            task_code::DONE => Status::Completed,
            task_code::WAITING => Status::Waiting,
            _ => Status::Unknown,
        }
    }

    pub fn from_flow_code(code: i32) -> Self {
        match code {
            flow_code::NOT_STARTED => Status::Created,
            flow_code::ACTIVE => Status::Started,
            flow_code::CANCELLED => Status::Cancelled,
            flow_code::COMPLETED => Status::Completed,
            flow_code::FAILED => Status::Failed,
            _ => Status::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "Created",
            Status::Scheduled => "Scheduled",
            Status::Skipped => "Skipped",
            Status::Started => "Started",
            Status::Failed => "Failed",
            Status::Completed => "Completed",
            Status::Cancelled => "Cancelled",
            Status::Waiting => "Waiting",
            Status::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(Status::Created),
            "scheduled" => Ok(Status::Scheduled),
            "skipped" => Ok(Status::Skipped),
            "started" => Ok(Status::Started),
            "failed" => Ok(Status::Failed),
            "completed" => Ok(Status::Completed),
            "cancelled" => Ok(Status::Cancelled),
            "waiting" => Ok(Status::Waiting),
            "unknown" => Ok(Status::Unknown),
            other => Err(format!("Invalid status: {}", other)),
        }
    }
}
