//! Core data model -- timers, test cases, environments, execution records, reports.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a timer. Only `open` timers hold a live scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerStatus {
    Open,
    Closed,
}

impl std::fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerStatus::Open => write!(f, "open"),
            TimerStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for TimerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TimerStatus::Open),
            "closed" => Ok(TimerStatus::Closed),
            other => Err(format!("unknown timer status '{}'", other)),
        }
    }
}

fn default_open() -> TimerStatus {
    TimerStatus::Open
}

/// A recurring job definition: one collection run on a cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub project_id: i64,
    pub col_id: i64,
    /// Environment name; empty selects the project's first environment.
    #[serde(default)]
    pub env: String,
    pub cron_expression: String,
    #[serde(default = "default_open")]
    pub status: TimerStatus,
    /// Notify on failure.
    #[serde(default)]
    pub notice: bool,
    /// Owning user id.
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub add_time: i64,
    #[serde(default)]
    pub up_time: i64,
}

/// Owning scope for collections and environments, with project-level
/// pre/after script defaults applied to every case of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub pre_script: String,
    #[serde(default)]
    pub after_script: String,
}

fn default_abled() -> bool {
    true
}

/// One request header; disabled entries are not sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_abled")]
    pub abled: bool,
}

/// One query parameter; disabled entries are not sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEntry {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_abled")]
    pub abled: bool,
}

/// One environment-level global variable, addressable as `{{global.<name>}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

fn default_script_type() -> String {
    "rhai".to_string()
}

/// One HTTP test definition belonging to a collection. Read-only input to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub col_id: i64,
    pub casename: String,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub req_headers: Vec<HeaderEntry>,
    #[serde(default)]
    pub req_query: Vec<QueryEntry>,
    #[serde(default)]
    pub req_body: serde_json::Value,
    /// Per-case override; falls back to the project-level script when empty.
    #[serde(default)]
    pub pre_script: String,
    #[serde(default)]
    pub after_script: String,
    /// Validation script run against the response.
    #[serde(default)]
    pub test_script: String,
    #[serde(default = "default_script_type")]
    pub test_script_type: String,
    #[serde(default)]
    pub case_env: String,
    /// Position within the collection; runs execute in ascending order.
    #[serde(default)]
    pub sort: i64,
}

/// A named deployment target: base domain, default headers, global variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub domain: String,
    #[serde(default)]
    pub header: Vec<HeaderEntry>,
    #[serde(default)]
    pub global: Vec<EnvVariable>,
}

/// A recorded validation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub message: String,
}

impl ValidationMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The per-case outcome of one run. Produced exactly once per case, immutable
/// once produced, and also the source of the run's `records` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Resolved request body as sent.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub res_header: HashMap<String, String>,
    #[serde(default)]
    pub res_body: serde_json::Value,
    /// Elapsed wall-clock time in milliseconds.
    #[serde(default)]
    pub run_time: u64,
    /// Resolved request parameters (query + body fields).
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub valid_res: Vec<ValidationMessage>,
}

impl ExecutionRecord {
    /// Validation script produced no messages.
    pub const CODE_PASSED: i64 = 0;
    /// Validation script produced one or more messages.
    pub const CODE_FAILED: i64 = 1;
    /// Request/transport error before validation could run.
    pub const CODE_ERROR: i64 = 400;
}

/// Aggregate run status derived purely from the failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The persisted aggregate outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub uid: i64,
    pub project_id: i64,
    pub col_id: i64,
    pub timer_id: i64,
    pub env: String,
    pub test_list: Vec<ExecutionRecord>,
    pub add_time: i64,
    pub status: RunStatus,
}

/// Resolved params/body of one executed case, kept for cross-case templating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    pub params: serde_json::Value,
    pub body: serde_json::Value,
}

/// Run-scoped map of prior cases' records, keyed by case id.
pub type RecordsMap = HashMap<i64, CaseRecord>;

/// Current unix time in seconds.
pub fn unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_with_stable_field_names() {
        let report = Report {
            uid: 7,
            project_id: 1,
            col_id: 2,
            timer_id: 3,
            env: "staging".into(),
            test_list: vec![],
            add_time: 1700000000,
            status: RunStatus::Ok,
        };

        let json = serde_json::to_value(&report).unwrap();
        for field in [
            "uid", "project_id", "col_id", "timer_id", "env", "test_list", "add_time", "status",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(json["status"], "ok");
    }

    #[test]
    fn test_timer_status_round_trip() {
        assert_eq!("open".parse::<TimerStatus>().unwrap(), TimerStatus::Open);
        assert_eq!(
            "closed".parse::<TimerStatus>().unwrap(),
            TimerStatus::Closed
        );
        assert!("paused".parse::<TimerStatus>().is_err());
        assert_eq!(TimerStatus::Open.to_string(), "open");
    }

    #[test]
    fn test_timer_deserializes_with_defaults() {
        let timer: Timer = serde_json::from_str(
            r#"{"name":"nightly","project_id":1,"col_id":2,"cron_expression":"0 0 2 * * *"}"#,
        )
        .unwrap();
        assert_eq!(timer.status, TimerStatus::Open);
        assert!(!timer.notice);
        assert_eq!(timer.env, "");
    }
}
