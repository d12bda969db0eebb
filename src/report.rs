//! Reports returned by agents and the boundary response shape

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyndicateError;
use crate::protocol::{AgentId, MessageId};

/// Status of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Started,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

/// Terminal artifact of one `execute` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    pub task_id: MessageId,
    pub status: ReportStatus,
    pub data: Value,
    pub errors: Vec<String>,
}

impl Report {
    pub fn new(agent_id: AgentId, task_id: MessageId, status: ReportStatus, data: Value) -> Self {
        Self {
            agent_id,
            timestamp: Utc::now(),
            task_id,
            status,
            data,
            errors: Vec::new(),
        }
    }

    pub fn completed(agent_id: AgentId, task_id: MessageId, data: Value) -> Self {
        Self::new(agent_id, task_id, ReportStatus::Completed, data)
    }

    pub fn failed<I, S>(agent_id: AgentId, task_id: MessageId, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut report = Self::new(agent_id, task_id, ReportStatus::Failed, Value::Null);
        report.errors = errors.into_iter().map(Into::into).collect();
        if report.errors.is_empty() {
            report.errors.push("unspecified failure".into());
        }
        report
    }

    pub fn blocked(agent_id: AgentId, task_id: MessageId, data: Value) -> Self {
        Self::new(agent_id, task_id, ReportStatus::Blocked, data)
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Completed
    }
}

/// User-visible result of every boundary call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub status: ReportStatus,
    pub data: Value,
    pub errors: Vec<String>,
}

impl Response {
    pub fn from_report(report: Report) -> Self {
        Self {
            success: report.is_success(),
            status: report.status,
            data: report.data,
            errors: report.errors,
        }
    }

    pub fn from_error(err: &SyndicateError) -> Self {
        Self {
            success: false,
            status: ReportStatus::Failed,
            data: Value::Null,
            errors: vec![err.to_string()],
        }
    }
}

impl From<Report> for Response {
    fn from(report: Report) -> Self {
        Self::from_report(report)
    }
}
